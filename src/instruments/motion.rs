// src/instruments/motion.rs
//
// Stage motion on top of controller-board commands.

use super::{ControllerBoard, InstrumentKind};
use crate::error::{LabError, LabResult};

pub const DEFAULT_STEPS_PER_MM: f64 = 6400.0;

/// Reads `steps_per_mm` from a stage URI such as
/// `us://pcb?steps_per_mm=6400`. Falls back to the default.
pub fn steps_per_mm(uri: &str) -> f64 {
    uri.split_once('?')
        .map(|(_, query)| query)
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == "steps_per_mm")
        .and_then(|(_, v)| v.parse().ok())
        .filter(|v: &f64| *v > 0.0)
        .unwrap_or(DEFAULT_STEPS_PER_MM)
}

pub struct MotionController<'a> {
    board: &'a mut dyn ControllerBoard,
    steps_per_mm: f64,
    axes: Vec<usize>,
    /// Travel per axis in mm.
    lengths: Vec<f64>,
}

impl<'a> MotionController<'a> {
    pub fn new(board: &'a mut dyn ControllerBoard, steps_per_mm: f64) -> Self {
        Self {
            board,
            steps_per_mm,
            axes: Vec::new(),
            lengths: Vec::new(),
        }
    }

    /// Discovers the axes and their travel.
    pub async fn connect(&mut self) -> LabResult<()> {
        self.axes = self.board.identity().await?.axes;
        self.lengths.clear();
        for axis in self.axes.clone() {
            let steps: f64 = self.expect_number(&format!("l{}", axis)).await?;
            self.lengths.push(steps / self.steps_per_mm);
        }
        log::debug!("Stage axes {:?}, travel {:?} mm", self.axes, self.lengths);
        Ok(())
    }

    pub fn lengths(&self) -> &[f64] {
        &self.lengths
    }

    pub async fn home(&mut self) -> LabResult<()> {
        self.expect_ack("h").await
    }

    /// Moves every axis to `pos` (mm). Extra coordinates are ignored.
    pub async fn goto(&mut self, pos: &[f64]) -> LabResult<()> {
        for (i, (axis, target)) in self.axes.clone().into_iter().zip(pos).enumerate() {
            if *target < 0.0 || *target > self.lengths[i] {
                return Err(LabError::instrument(
                    InstrumentKind::StageController,
                    format!("axis {} target {} mm outside 0..{} mm", axis, target, self.lengths[i]),
                ));
            }
            let steps = (target * self.steps_per_mm).round() as i64;
            self.expect_ack(&format!("g{}{}", axis, steps)).await?;
        }
        Ok(())
    }

    /// Current position in mm, one entry per axis.
    pub async fn read_pos(&mut self) -> LabResult<Vec<f64>> {
        let mut pos = Vec::with_capacity(self.axes.len());
        for axis in self.axes.clone() {
            let steps = self.expect_number(&format!("r{}", axis)).await?;
            pos.push(steps / self.steps_per_mm);
        }
        Ok(pos)
    }

    async fn expect_ack(&mut self, cmd: &str) -> LabResult<()> {
        let reply = self.board.query(cmd).await?;
        if reply.is_empty() {
            Ok(())
        } else {
            Err(LabError::instrument(
                InstrumentKind::StageController,
                format!("'{}' not acknowledged: {}", cmd, reply),
            ))
        }
    }

    async fn expect_number(&mut self, cmd: &str) -> LabResult<f64> {
        let reply = self.board.query(cmd).await?;
        reply.trim().parse().map_err(|_| {
            LabError::instrument(
                InstrumentKind::StageController,
                format!("'{}' returned '{}'", cmd, reply),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::virt::VirtualBoard;
    use crate::instruments::SimBench;

    #[test]
    fn uri_scale_overrides_default() {
        assert_eq!(steps_per_mm("us://pcb?steps_per_mm=100"), 100.0);
        assert_eq!(steps_per_mm("us://pcb"), DEFAULT_STEPS_PER_MM);
        assert_eq!(steps_per_mm("us://pcb?steps_per_mm=-1"), DEFAULT_STEPS_PER_MM);
    }

    #[tokio::test]
    async fn goto_then_read_back() {
        let mut board = VirtualBoard::new("pcb", SimBench::new());
        let mut stage = MotionController::new(&mut board, 100.0);
        stage.connect().await.unwrap();
        assert_eq!(stage.lengths(), &[2500.0, 2500.0]);
        stage.goto(&[12.5, 40.0]).await.unwrap();
        assert_eq!(stage.read_pos().await.unwrap(), vec![12.5, 40.0]);
        stage.home().await.unwrap();
        assert_eq!(stage.read_pos().await.unwrap(), vec![0.0, 0.0]);
        assert!(stage.goto(&[-1.0]).await.is_err());
    }
}
