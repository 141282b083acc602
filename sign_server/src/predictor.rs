//! Frame predictor: hand localization followed by sign classification.
//!
use anyhow::{bail, Result};
use common::protocol::{ImagePrediction, NO_HAND_LABEL};
use image::RgbImage;

use crate::{
    hand::HandLocalizer,
    labels::LabelSet,
    meter::METER,
    nn::{resize_for_classifier, to_unit_tensor, Classifier},
};

/// Outcome of predicting a single frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Prediction {
    NoHand,
    Sign { label: String, confidence: f32 },
}

impl Prediction {
    /// Label to report, the sentinel text for frames without a hand.
    pub fn label(&self) -> &str {
        match self {
            Prediction::NoHand => NO_HAND_LABEL,
            Prediction::Sign { label, .. } => label,
        }
    }

    pub fn confidence(&self) -> f32 {
        match self {
            Prediction::NoHand => 0.0,
            Prediction::Sign { confidence, .. } => *confidence,
        }
    }

    /// Text drawn onto live frames.
    pub fn display_text(&self) -> String {
        match self {
            Prediction::NoHand => NO_HAND_LABEL.to_owned(),
            Prediction::Sign { label, confidence } => format!("{label} ({confidence:.2})"),
        }
    }
}

impl From<Prediction> for ImagePrediction {
    fn from(prediction: Prediction) -> Self {
        Self {
            confidence: prediction.confidence(),
            prediction: match prediction {
                Prediction::NoHand => NO_HAND_LABEL.to_owned(),
                Prediction::Sign { label, .. } => label,
            },
        }
    }
}

pub struct FramePredictor {
    localizer: HandLocalizer,
    classifier: Box<dyn Classifier>,
    labels: LabelSet,
}

impl FramePredictor {
    pub fn new(localizer: HandLocalizer, classifier: Box<dyn Classifier>, labels: LabelSet) -> Self {
        Self {
            localizer,
            classifier,
            labels,
        }
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn predict(&self, frame: &RgbImage) -> Result<Prediction> {
        let crop = match self.localizer.locate(frame)? {
            Some(crop) => crop,
            None => {
                METER.handless_frame();
                return Ok(Prediction::NoHand);
            }
        };

        let input = to_unit_tensor(&resize_for_classifier(&crop));
        let probabilities = self.classifier.classify(input)?;
        METER.hand_crop();

        if probabilities.len() != self.labels.len() {
            bail!(
                "classifier returned {} probabilities for {} labels",
                probabilities.len(),
                self.labels.len()
            );
        }

        let (index, confidence) = match argmax(&probabilities) {
            Some(best) => best,
            None => bail!("classifier returned no probabilities"),
        };
        let label = match self.labels.get(index) {
            Some(label) => label.to_owned(),
            None => bail!("no label for class index {index}"),
        };
        log::debug!("Predicted {label} with confidence {confidence:.3}");

        Ok(Prediction::Sign { label, confidence })
    }
}

/// Index and value of the largest element, the first one on ties.
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (index, value)| match best {
            Some((_, best_value)) if best_value >= value => best,
            _ => Some((index, value)),
        })
}
