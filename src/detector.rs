use std::collections::HashSet;

use anyhow::{bail, Result};

use crate::model::{Classifier, InferenceError, Scores};
use crate::{DEBOUNCE_TICKS, IGNORE_LABELS, WINDOW_SAMPLES};

/// A stable, non-ignored label: the detector saw the same prediction on
/// [`DEBOUNCE_TICKS`] consecutive inference ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: String,
    pub score: f32,
}

/// Sliding-window command detector.
///
/// Keeps a 1-second rolling window of int16 PCM. Every pushed block
/// shifts the window left and appends at the tail, so the newest samples
/// are always newest in time, then runs one inference over the full
/// window and debounces the predicted label.
///
/// Emission is edge-triggered: a detection fires exactly once, on the
/// tick the consecutive count reaches the threshold. The count keeps
/// climbing silently after that, so a label held indefinitely reports
/// once until the prediction changes away and back.
pub struct CommandDetector<C: Classifier> {
    classifier: C,
    window: Vec<i16>,
    ignore: HashSet<usize>,
    previous_index: Option<usize>,
    consecutive: u32,
    last_scores: Option<Scores>,
}

impl<C: Classifier> CommandDetector<C> {
    pub fn new(classifier: C) -> Result<Self> {
        let frame_size = classifier.input_frame_size();
        if frame_size != WINDOW_SAMPLES {
            bail!(
                "model expects {frame_size} samples per inference, \
                 the {WINDOW_SAMPLES}-sample window cannot feed it"
            );
        }

        let ignore = classifier
            .categories()
            .iter()
            .enumerate()
            .filter(|(_, c)| IGNORE_LABELS.contains(&c.as_str()))
            .map(|(i, _)| i)
            .collect();

        Ok(Self {
            classifier,
            window: vec![0; WINDOW_SAMPLES],
            ignore,
            previous_index: None,
            consecutive: 0,
            last_scores: None,
        })
    }

    /// Advance the window by one block of samples and run one inference
    /// tick. Returns a detection when a label just became stable.
    ///
    /// An inference failure is recoverable: the error is returned, the
    /// tick produces no observation and the debounce state is unchanged.
    pub fn push(&mut self, block: &[i16]) -> Result<Option<Detection>, InferenceError> {
        if block.is_empty() {
            return Ok(None);
        }

        if block.len() >= self.window.len() {
            let tail = &block[block.len() - self.window.len()..];
            self.window.copy_from_slice(tail);
        } else {
            let keep = self.window.len() - block.len();
            self.window.copy_within(block.len().., 0);
            self.window[keep..].copy_from_slice(block);
        }

        let scores = self.classifier.classify(&self.window)?;
        let predicted = scores.top_index;

        if self.previous_index == Some(predicted) {
            self.consecutive += 1;
        } else {
            self.previous_index = Some(predicted);
            self.consecutive = 1;
        }

        let detection = if self.consecutive == DEBOUNCE_TICKS && !self.ignore.contains(&predicted)
        {
            Some(Detection {
                label: self.classifier.categories()[predicted].clone(),
                score: scores.top(),
            })
        } else {
            None
        };

        self.last_scores = Some(scores);
        Ok(detection)
    }

    /// Most recent successful inference, if any.
    pub fn last_scores(&self) -> Option<&Scores> {
        self.last_scores.as_ref()
    }

    pub fn categories(&self) -> &[String] {
        self.classifier.categories()
    }

    pub fn commands(&self) -> Vec<String> {
        self.classifier.commands()
    }

    /// Clear the window and debounce state, e.g. when switching the audio
    /// source.
    pub fn reset(&mut self) {
        self.window.fill(0);
        self.previous_index = None;
        self.consecutive = 0;
        self.last_scores = None;
    }
}
