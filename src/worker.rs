// src/worker.rs
// 后台线程句柄：停止信号 + JoinHandle，停止时先断开信号再 join
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::warn;

/// Worker-side view of the stop request. Fires once the handle sends or drops.
#[derive(Clone, Debug)]
pub struct StopSignal {
    rx: Receiver<()>,
}
impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(TryRecvError::Empty))
    }
    /// Sleeps up to `timeout`, waking early on stop. Returns true when stopped.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

/// Owns a background thread. Whatever the thread returns comes back from
/// [`WorkerHandle::stop`], so the caller regains its state only after the
/// thread has finished touching it.
pub struct WorkerHandle<T> {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<T>>,
}
impl<T> WorkerHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
    /// Signals the worker without waiting for it.
    pub fn request_stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
    }
    /// Signals and joins. `None` when the worker panicked.
    pub fn stop(mut self) -> Option<T> {
        self.request_stop();
        self.join_inner()
    }
    fn join_inner(&mut self) -> Option<T> {
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("worker '{}' panicked", self.name);
                None
            }
        }
    }
}
impl<T> Drop for WorkerHandle<T> {
    fn drop(&mut self) {
        self.request_stop();
        let _ = self.join_inner();
    }
}

pub fn spawn_worker<T, F>(name: &str, body: F) -> io::Result<WorkerHandle<T>>
where
    T: Send + 'static,
    F: FnOnce(StopSignal) -> T + Send + 'static,
{
    let (stop_tx, stop_rx) = bounded(1);
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(StopSignal { rx: stop_rx }))?;
    Ok(WorkerHandle {
        name: name.to_string(),
        stop_tx: Some(stop_tx),
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    #[test]
    fn stop_joins_quickly_and_returns_the_accumulator() {
        let worker = spawn_worker("acc", |stop| {
            let mut acc = Vec::new();
            while !stop.wait_timeout(Duration::from_millis(2)) {
                acc.push(acc.len());
            }
            acc
        })
        .unwrap();
        thread::sleep(Duration::from_millis(30));
        let started = Instant::now();
        let acc = worker.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        let len = acc.len();
        thread::sleep(Duration::from_millis(20));
        // the worker is gone; nothing else can append
        assert_eq!(acc.len(), len);
        assert!(acc.iter().enumerate().all(|(i, v)| i == *v));
    }
    #[test]
    fn dropping_the_handle_stops_the_worker() {
        let (tx, rx) = bounded::<()>(1);
        let worker = spawn_worker("drop", move |stop| {
            while !stop.wait_timeout(Duration::from_millis(5)) {}
            let _ = tx.send(());
        })
        .unwrap();
        drop(worker);
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }
    #[test]
    fn is_stopped_only_after_request() {
        let (probe_tx, probe_rx) = bounded(2);
        let mut worker = spawn_worker("probe", move |stop| {
            let _ = probe_tx.send(stop.is_stopped());
            while !stop.wait_timeout(Duration::from_millis(5)) {}
            let _ = probe_tx.send(stop.is_stopped());
        })
        .unwrap();
        assert_eq!(probe_rx.recv_timeout(Duration::from_secs(1)), Ok(false));
        worker.request_stop();
        assert_eq!(probe_rx.recv_timeout(Duration::from_secs(1)), Ok(true));
        assert!(worker.stop().is_some());
    }
}
