// src/stats.rs
use serde::Serialize;

/// 一组数值的描述统计 (总体标准差)
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SummaryStats {
    pub count: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl SummaryStats {
    /// 空输入返回 None
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        // 1. 均值
        let mean = values.iter().sum::<f64>() / n;
        // 2. 方差 (除以 N，与标定公式一致)
        let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        // 3. 极值
        let (min, max) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        Some(Self {
            count: values.len(),
            mean,
            std_dev: variance.sqrt(),
            min,
            max,
        })
    }
}

/// 阈值统计：达到阈值的样本数，以及第一次达到阈值的位置
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ThresholdStats {
    pub threshold: f64,
    pub count: usize,
    pub above: usize,
    pub first_crossing: Option<usize>,
}

impl ThresholdStats {
    pub fn compute(values: &[f64], threshold: f64) -> Self {
        Self {
            threshold,
            count: values.len(),
            above: values.iter().filter(|v| **v >= threshold).count(),
            first_crossing: values.iter().position(|v| *v >= threshold),
        }
    }

    pub fn above_percent(&self) -> f64 {
        percent(self.above, self.count)
    }

    /// 第一次越过阈值时已经过的比例；从未越过则为 None
    pub fn first_crossing_percent(&self) -> Option<f64> {
        self.first_crossing.map(|i| percent(i, self.count))
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}
