use std::io::Write;

use anyhow::{Context, Result};
use serde_json::Value;

use lumberjack_types::LiveFrame;

use crate::sluice::FrameParser;

/// Prints each line of a `{"logs": [...]}` frame, prefixed by its source
#[derive(Debug)]
pub struct PrintParser {
    prefix: String,
}

impl PrintParser {
    pub fn new(url: &str) -> Self {
        Self {
            prefix: url.to_owned(),
        }
    }

    fn write_frame(&self, frame: Value, out: &mut impl Write) -> Result<()> {
        let frame: LiveFrame =
            serde_json::from_value(frame).context("Frame is not a log frame")?;
        for line in &frame.logs {
            writeln!(out, "{}: {}", self.prefix, line)?;
        }
        Ok(())
    }
}

impl FrameParser for PrintParser {
    fn parse(&mut self, frame: Value) -> Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        self.write_frame(frame, &mut out)
    }
}

/// Accepts every frame; record totals come from the sluice's stats
#[derive(Debug, Default)]
pub struct CountParser {
    frames: u64,
}

impl CountParser {
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl FrameParser for CountParser {
    fn parse(&mut self, _frame: Value) -> Result<()> {
        self.frames += 1;
        Ok(())
    }
}
