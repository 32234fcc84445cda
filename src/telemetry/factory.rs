use time::OffsetDateTime;

use super::record::{DataAnnotation, EncodedImage, EventPayload, EventRecord, ModelEventName};
use crate::models::OnDeviceModel;

fn now_seconds() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn install_event(model: &OnDeviceModel) -> EventRecord {
    EventRecord::new(
        ModelEventName::ModelInstall.as_str(),
        now_seconds(),
        EventPayload::Install {
            model_uid: model.model_id().to_string(),
            model_version: model.version,
            is_ota: model.downloaded_over_network,
        },
    )
}

pub fn prediction_timing(model: &OnDeviceModel, elapsed_ns: u64) -> EventRecord {
    custom_timing(ModelEventName::PredictionTiming, model, elapsed_ns)
}

pub fn custom_timing(name: ModelEventName, model: &OnDeviceModel, elapsed_ns: u64) -> EventRecord {
    EventRecord::new(
        name.as_str(),
        now_seconds(),
        EventPayload::Timing {
            model_uid: model.model_id().to_string(),
            model_version: model.version,
            elapsed_nano_seconds: elapsed_ns,
        },
    )
}

pub fn annotation_event(
    model: &OnDeviceModel,
    image: &EncodedImage,
    predicted: Vec<DataAnnotation>,
    modified: Option<Vec<DataAnnotation>>,
) -> EventRecord {
    EventRecord::new(
        ModelEventName::PredictAnnotation.as_str(),
        now_seconds(),
        EventPayload::Annotation {
            model_uid: model.model_id().to_string(),
            model_version: model.version,
            input: image.data.clone(),
            input_width: image.width,
            input_height: image.height,
            predicted_annotations: predicted,
            modified_annotations: modified,
        },
    )
}
