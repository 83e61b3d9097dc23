//! Loss-curve reporting

use plotly::{
    common::Mode,
    layout::{Axis, Layout},
    Plot, Scatter,
};
use std::path::Path;
use std::str::FromStr;

pub const LOSS_CURVE_FILE: &str = "loss_curve.html";

/// Where training progress is reported besides the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportTo {
    #[default]
    None,
    /// Writes `loss_curve.html` into the output directory
    LossPlot,
}

impl FromStr for ReportTo {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "loss-plot" => Ok(Self::LossPlot),
            _ => anyhow::bail!("Unknown report target `{s}`; expected none or loss-plot"),
        }
    }
}

/// Plots train and eval losses against optimizer steps as an HTML page.
pub fn plot_losses<P: AsRef<Path>>(
    train_points: &[(usize, f64)],
    eval_points: &[(usize, f64)],
    save_path: P,
) {
    let (train_steps, train_losses): (Vec<usize>, Vec<f64>) = train_points.iter().copied().unzip();
    let (eval_steps, eval_losses): (Vec<usize>, Vec<f64>) = eval_points.iter().copied().unzip();

    let train_trace = Scatter::new(train_steps, train_losses)
        .name("Training loss")
        .mode(Mode::Lines);
    let eval_trace = Scatter::new(eval_steps, eval_losses)
        .name("Evaluation loss")
        .mode(Mode::LinesMarkers);

    let mut plot = Plot::new();
    plot.add_trace(train_trace);
    plot.add_trace(eval_trace);
    let layout = Layout::new()
        .x_axis(Axis::new().title("Step"))
        .y_axis(Axis::new().title("Loss"));
    plot.set_layout(layout);
    plot.write_html(save_path.as_ref());
}
