//! Evaluation metrics over paired rewards

use anyhow::bail;
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use std::fmt::Display;

/// Summary statistics of a sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Describe {
    pub nobs: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Unbiased (n - 1) variance; `NaN` for fewer than two observations
    pub variance: f64,
}

impl Describe {
    pub fn new(xs: &[f32]) -> anyhow::Result<Self> {
        if xs.is_empty() {
            bail!("Cannot describe an empty sample");
        }
        let nobs = xs.len();
        let (min, max, sum) = xs.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0_f64),
            |(min, max, sum), &x| {
                let x = x as f64;
                (min.min(x), max.max(x), sum + x)
            },
        );
        let mean = sum / nobs as f64;
        let variance = if nobs > 1 {
            xs.iter().map(|&x| (x as f64 - mean).powi(2)).sum::<f64>() / (nobs - 1) as f64
        } else {
            f64::NAN
        };
        Ok(Self {
            nobs,
            min,
            max,
            mean,
            variance,
        })
    }

    pub fn std(&self) -> f64 {
        self.variance.sqrt()
    }
}

/// Reward statistics and ranking accuracy of an evaluation run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RewardMetrics {
    pub rewards_j: Describe,
    pub rewards_k: Describe,
    pub rewards_total_mean: f64,
    pub rewards_total_std: f64,
    pub accuracy: f64,
}

/// Index of the larger reward for every pair; ties go to `j` (index 0).
pub fn predictions(rewards_j: &[f32], rewards_k: &[f32]) -> Vec<usize> {
    rewards_j
        .iter()
        .zip(rewards_k.iter())
        .map(|(j, k)| usize::from(k > j))
        .collect()
}

/// Computes reward statistics and the fraction of pairs ranked correctly.
///
/// The reference label of every pair is 0, since `j` is always the
/// preferred side.
pub fn compute_metrics(rewards_j: &[f32], rewards_k: &[f32]) -> anyhow::Result<RewardMetrics> {
    if rewards_j.len() != rewards_k.len() {
        bail!(
            "Reward columns differ in length: {} vs {}",
            rewards_j.len(),
            rewards_k.len()
        );
    }
    let desc_j = Describe::new(rewards_j)?;
    let desc_k = Describe::new(rewards_k)?;

    let preds = predictions(rewards_j, rewards_k);
    let correct = preds.iter().filter(|p| **p == 0).count();

    let metrics = RewardMetrics {
        rewards_j: desc_j,
        rewards_k: desc_k,
        rewards_total_mean: (desc_j.mean + desc_k.mean) / 2.0,
        rewards_total_std: ((desc_j.variance + desc_k.variance) / 2.0).sqrt(),
        accuracy: correct as f64 / preds.len() as f64,
    };
    tracing::info!(
        rewards_j_mean = metrics.rewards_j.mean,
        rewards_k_mean = metrics.rewards_k.mean,
        rewards_total_mean = metrics.rewards_total_mean,
        rewards_j_std = metrics.rewards_j.std(),
        rewards_k_std = metrics.rewards_k.std(),
        rewards_total_std = metrics.rewards_total_std,
        "reward statistics"
    );
    Ok(metrics)
}

impl Display for RewardMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_header(vec!["", "n", "min", "max", "mean", "std"]);
        for (name, d) in [("rewards_j", &self.rewards_j), ("rewards_k", &self.rewards_k)] {
            table.add_row(vec![
                Cell::new(name),
                Cell::new(d.nobs),
                Cell::new(format!("{:.4}", d.min)),
                Cell::new(format!("{:.4}", d.max)),
                Cell::new(format!("{:.4}", d.mean)),
                Cell::new(format!("{:.4}", d.std())),
            ]);
        }
        table.add_row(vec![
            Cell::new("total"),
            Cell::new(self.rewards_j.nobs + self.rewards_k.nobs),
            Cell::new(""),
            Cell::new(""),
            Cell::new(format!("{:.4}", self.rewards_total_mean)),
            Cell::new(format!("{:.4}", self.rewards_total_std)),
        ]);
        writeln!(f, "{table}")?;
        write!(f, "accuracy: {:.4}", self.accuracy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::*;

    #[rstest]
    fn test_describe() -> Result<()> {
        let d = Describe::new(&[1.0, 2.0, 3.0, 4.0])?;
        assert_eq!(d.nobs, 4_usize);
        assert_eq!(d.min, 1.0_f64);
        assert_eq!(d.max, 4.0_f64);
        assert_eq!(d.mean, 2.5_f64);
        assert!((d.variance - 5.0 / 3.0).abs() < 1e-12);

        assert!(Describe::new(&[7.0])?.variance.is_nan());
        assert!(Describe::new(&[]).is_err());
        Ok(())
    }

    #[rstest]
    fn test_accuracy_seven_of_ten() -> Result<()> {
        let rewards_j = [1.0_f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 0.0, 0.0, 0.0];
        let rewards_k = [0.0_f32, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0];
        let metrics = compute_metrics(&rewards_j, &rewards_k)?;
        assert!((metrics.accuracy - 0.7).abs() < 1e-12);
        Ok(())
    }

    #[rstest]
    fn test_ties_count_as_j_wins() -> Result<()> {
        let rewards = [0.5_f32, -0.5, 2.0];
        assert_eq!(predictions(&rewards, &rewards), vec![0_usize; 3]);
        assert_eq!(compute_metrics(&rewards, &rewards)?.accuracy, 1.0_f64);
        Ok(())
    }

    #[rstest]
    fn test_total_mean_and_std() -> Result<()> {
        let metrics = compute_metrics(&[1.0, 3.0], &[0.0, 4.0])?;
        // means 2 and 2, variances 2 and 8
        assert_eq!(metrics.rewards_total_mean, 2.0_f64);
        assert!((metrics.rewards_total_std - 5.0_f64.sqrt()).abs() < 1e-12);
        assert_eq!(metrics.accuracy, 0.5_f64);
        Ok(())
    }

    #[rstest]
    fn test_length_mismatch_errors() {
        assert!(compute_metrics(&[1.0, 2.0], &[1.0]).is_err());
    }

    #[rstest]
    fn test_display_contains_accuracy() -> Result<()> {
        let metrics = compute_metrics(&[1.0, 3.0], &[0.0, 4.0])?;
        let rendered = metrics.to_string();
        assert!(rendered.contains("rewards_j"));
        assert!(rendered.contains("accuracy: 0.5000"));
        Ok(())
    }
}
