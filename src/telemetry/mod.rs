pub mod api;
pub mod factory;
pub mod queue;
pub mod record;

pub use api::{ApiClient, ApiError, HttpBatchSender, ModelApi, SessionApi};
pub use queue::{BatchSender, EventQueue, EventSink, SendCallback, MAX_EVENTS_TO_SEND};
pub use record::{
    BoundingBoxAnnotation, DataAnnotation, EncodedImage, EventPayload, EventRecord,
    KeypointAnnotation, ModelEventName, SegmentationAnnotation,
};
