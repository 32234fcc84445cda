use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelEventName {
    PredictionTiming,
    ModelInstall,
    ModelPreprocess,
    ModelPostprocess,
    ModelDownloadCompleted,
    ModelDecryptionCompleted,
    ModelDecryptionFailed,
    PredictAnnotation,
}

impl ModelEventName {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelEventName::PredictionTiming => "prediction",
            ModelEventName::ModelInstall => "model_installed",
            ModelEventName::ModelPreprocess => "model_preprocess",
            ModelEventName::ModelPostprocess => "model_postprocess",
            ModelEventName::ModelDownloadCompleted => "model_download_completed",
            ModelEventName::ModelDecryptionCompleted => "model_decryption_completed",
            ModelEventName::ModelDecryptionFailed => "model_decryption_failed",
            ModelEventName::PredictAnnotation => "prediction_annotation",
        }
    }
}

impl std::fmt::Display for ModelEventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeypointAnnotation {
    pub id: i32,
    pub label: String,
    pub x: f32,
    pub y: f32,
    pub visibility: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBoxAnnotation {
    pub xmin: f32,
    pub ymin: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationAnnotation {
    pub mask: Vec<Vec<i32>>,
}

/// One labelled region of an input image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataAnnotation {
    pub label: String,
    #[serde(default)]
    pub keypoints: Vec<KeypointAnnotation>,
    pub bbox: Option<BoundingBoxAnnotation>,
    pub segmentation: Option<SegmentationAnnotation>,
    #[serde(default)]
    pub is_image_label: bool,
}

impl DataAnnotation {
    pub fn label(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            keypoints: Vec::new(),
            bbox: None,
            segmentation: None,
            is_image_label: true,
        }
    }

    pub fn bounding_box(label: impl Into<String>, bbox: BoundingBoxAnnotation) -> Self {
        Self {
            label: label.into(),
            keypoints: Vec::new(),
            bbox: Some(bbox),
            segmentation: None,
            is_image_label: false,
        }
    }
}

/// Base64-encoded image plus the dimensions it was encoded at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedImage {
    pub data: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Install {
        model_uid: String,
        model_version: i32,
        is_ota: bool,
    },
    Timing {
        model_uid: String,
        model_version: i32,
        elapsed_nano_seconds: u64,
    },
    Annotation {
        model_uid: String,
        model_version: i32,
        input: String,
        input_width: u32,
        input_height: u32,
        predicted_annotations: Vec<DataAnnotation>,
        modified_annotations: Option<Vec<DataAnnotation>>,
    },
}

/// A telemetry event as sent to the backend: `{type, timestamp, data}`.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: i64,
    pub data: EventPayload,
}

impl EventRecord {
    pub fn new(event_type: impl Into<String>, timestamp: i64, data: EventPayload) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp,
            data,
        }
    }
}

/// Two events of the same type stamped in the same second compare equal,
/// whatever their payloads.
impl PartialEq for EventRecord {
    fn eq(&self, other: &Self) -> bool {
        self.event_type.eq_ignore_ascii_case(&other.event_type) && self.timestamp == other.timestamp
    }
}

impl std::fmt::Display for EventRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventRecord({})", self.event_type)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn event_serializes_to_wire_shape() {
        let event = EventRecord::new(
            ModelEventName::ModelInstall.as_str(),
            1_700_000_000,
            EventPayload::Install {
                model_uid: "m1".into(),
                model_version: 3,
                is_ota: false,
            },
        );
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "model_installed",
                "timestamp": 1_700_000_000,
                "data": { "model_uid": "m1", "model_version": 3, "is_ota": false }
            })
        );
    }

    #[test]
    fn annotation_payload_keeps_null_fields() {
        let payload = EventPayload::Annotation {
            model_uid: "m1".into(),
            model_version: 1,
            input: "aGVsbG8=".into(),
            input_width: 2,
            input_height: 4,
            predicted_annotations: vec![DataAnnotation::label("cat")],
            modified_annotations: None,
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["modified_annotations"], serde_json::Value::Null);
        assert_eq!(value["predicted_annotations"][0]["label"], "cat");
        assert_eq!(value["predicted_annotations"][0]["bbox"], serde_json::Value::Null);
        assert_eq!(value["predicted_annotations"][0]["is_image_label"], true);
    }

    #[test]
    fn equality_uses_type_and_second_only() {
        let timing = |elapsed| EventPayload::Timing {
            model_uid: "m1".into(),
            model_version: 1,
            elapsed_nano_seconds: elapsed,
        };
        let a = EventRecord::new("prediction", 10, timing(5));
        let b = EventRecord::new("PREDICTION", 10, timing(9));
        let c = EventRecord::new("prediction", 11, timing(5));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
