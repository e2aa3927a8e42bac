// src/operator.rs
// 操作员控制台：后台线程读取标准输入，转成命令
use std::io::{self, BufRead};
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, info};

use crate::types::OperatorCommand;

/// Non-blocking source of operator commands, polled by every wait loop.
pub struct OperatorConsole {
    rx: Receiver<OperatorCommand>,
}

impl OperatorConsole {
    /// Reads commands from stdin on a detached thread: an empty line continues,
    /// `r` restarts the current block, `q` quits.
    pub fn stdin() -> io::Result<Self> {
        let (tx, rx) = unbounded();
        // 线程阻塞在 stdin 上，无法被唤醒，因此不 join
        thread::Builder::new()
            .name("operator".into())
            .spawn(move || read_commands(io::stdin().lock(), &tx))?;
        info!("operator keys: <Enter> continue/skip, r <Enter> restart block, q <Enter> quit");
        Ok(Self { rx })
    }

    /// Console with a fixed list of commands queued up front.
    #[cfg(test)]
    pub fn scripted(commands: impl IntoIterator<Item = OperatorCommand>) -> Self {
        let (tx, rx) = unbounded();
        for command in commands {
            let _ = tx.send(command);
        }
        Self { rx }
    }

    pub fn poll(&self) -> Option<OperatorCommand> {
        match self.rx.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty) => None,
            // stdin closed: nobody can steer the session any more
            Err(TryRecvError::Disconnected) => None,
        }
    }
}

pub fn parse_command(line: &str) -> Option<OperatorCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" | "c" | "s" => Some(OperatorCommand::Continue),
        "r" => Some(OperatorCommand::RestartBlock),
        "q" | "quit" => Some(OperatorCommand::Quit),
        _ => None,
    }
}

fn read_commands(input: impl BufRead, tx: &Sender<OperatorCommand>) {
    for line in input.lines() {
        let Ok(line) = line else { break };
        match parse_command(&line) {
            Some(command) => {
                if tx.send(command).is_err() {
                    break;
                }
            }
            None => debug!("unknown operator input {line:?}"),
        }
    }
}
