//! Prompts waiting for the next inference call.

use crate::error::{Result, SessionError};

/// Point polarity as understood by the segmentation model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointLabel {
    Foreground,
    Background,
}

impl PointLabel {
    /// Label value fed to the SAM decoder
    pub fn model_label(self) -> f32 {
        match self {
            PointLabel::Foreground => 1.0,
            PointLabel::Background => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromptPoint {
    pub x: f32,
    pub y: f32,
    pub label: PointLabel,
}

impl PromptPoint {
    pub fn new(x: f32, y: f32, label: PointLabel) -> Self {
        Self { x, y, label }
    }

    pub fn foreground(x: f32, y: f32) -> Self {
        Self::new(x, y, PointLabel::Foreground)
    }

    pub fn background(x: f32, y: f32) -> Self {
        Self::new(x, y, PointLabel::Background)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PromptBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl PromptBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

/// Copy of the buffer taken just before an inference call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptSnapshot {
    points: Vec<PromptPoint>,
    boxes: Vec<PromptBox>,
}

/// Points and boxes accumulated since the last inference
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptBuffer {
    points: Vec<PromptPoint>,
    boxes: Vec<PromptBox>,
}

impl PromptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_point(&mut self, point: PromptPoint) {
        self.points.push(point);
    }

    pub fn push_box(&mut self, prompt_box: PromptBox) {
        self.boxes.push(prompt_box);
    }

    pub fn pop_point(&mut self) -> Result<PromptPoint> {
        self.points.pop().ok_or(SessionError::EmptyStore)
    }

    pub fn pop_box(&mut self) -> Result<PromptBox> {
        self.boxes.pop().ok_or(SessionError::EmptyStore)
    }

    pub fn points(&self) -> &[PromptPoint] {
        &self.points
    }

    pub fn boxes(&self) -> &[PromptBox] {
        &self.boxes
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty() && self.boxes.is_empty()
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.boxes.clear();
    }

    pub fn snapshot(&self) -> PromptSnapshot {
        PromptSnapshot {
            points: self.points.clone(),
            boxes: self.boxes.clone(),
        }
    }

    /// Replace the buffer with the snapshot's contents
    pub fn restore(&mut self, snapshot: PromptSnapshot) {
        self.points = snapshot.points;
        self.boxes = snapshot.boxes;
    }
}
