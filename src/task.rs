use std::fmt;
use std::str::FromStr;

use crate::errors::HarnessError;

/// The kind of head a checkpoint was trained with.
///
/// It decides which of the five result fields get populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Task {
    #[default]
    Detect,
    Segment,
    Pose,
    Classify,
    Obb,
}

impl Task {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Detect => "detect",
            Self::Segment => "segment",
            Self::Pose => "pose",
            Self::Classify => "classify",
            Self::Obb => "obb",
        }
    }

    /// Letterboxed inputs and box outputs; everything except classification.
    pub const fn is_dense(self) -> bool {
        !matches!(self, Self::Classify)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Task {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_matches(|c: char| c == '\'' || c == '"').to_lowercase().as_str() {
            "detect" | "detection" => Ok(Self::Detect),
            "segment" | "segmentation" => Ok(Self::Segment),
            "pose" | "keypoints" => Ok(Self::Pose),
            "classify" | "classification" => Ok(Self::Classify),
            "obb" => Ok(Self::Obb),
            other => Err(HarnessError::configuration(format!(
                "unknown task type `{other}`"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_parsing() {
        let test_cases = vec![
            ("detect", Task::Detect),
            ("'segment'", Task::Segment),
            (" Pose ", Task::Pose),
            ("classify", Task::Classify),
            ("obb", Task::Obb),
        ];

        for (input, expected) in test_cases {
            assert_eq!(input.parse::<Task>().unwrap(), expected, "{input}");
        }
        assert!("tracking".parse::<Task>().is_err());
    }

    #[test]
    fn test_only_classify_is_not_dense() {
        assert!(Task::Detect.is_dense());
        assert!(Task::Obb.is_dense());
        assert!(!Task::Classify.is_dense());
    }
}
