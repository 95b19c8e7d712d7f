use std::path::Path;

use nestcam_data::{FrameRecord, PredictionRecord};
use ring_client::models::{DeviceFamily, Devices, HistoryEvent};

use crate::{
    Result,
    models::{Device, DeviceKind, Event, EventId, Frame, Prediction},
};

const FAMILIES: [(DeviceFamily, DeviceKind); 5] = [
    (DeviceFamily::StickupCams, DeviceKind::Camera),
    (DeviceFamily::Doorbots, DeviceKind::Doorbell),
    (DeviceFamily::AuthorizedDoorbots, DeviceKind::Doorbell),
    (DeviceFamily::Chimes, DeviceKind::Chime),
    (DeviceFamily::Other, DeviceKind::Other),
];

pub fn devices_from_ring(devices: &Devices) -> Vec<Device> {
    FAMILIES
        .iter()
        .flat_map(|(family, kind)| {
            devices.family(*family).iter().map(|device| Device {
                id: device.id.clone(),
                name: device.description.clone(),
                kind: *kind,
            })
        })
        .collect()
}

pub fn event_from_history(event: HistoryEvent) -> Event {
    Event {
        id: EventId::new(event.id),
        created_at: event.created_at,
        kind: event.kind,
    }
}

pub fn frame_record(frame: &Frame, stored_path: &Path) -> FrameRecord {
    FrameRecord {
        filename: frame.filename(),
        event_id: frame.event_id.to_string(),
        captured_at: frame.captured_at,
        stored_path: stored_path.display().to_string(),
    }
}

/// The row shape both sinks persist. Bounding boxes are stored as a JSON
/// array, or JSON `null` for classification results.
pub fn prediction_row(
    frame: &Frame,
    endpoint_id: &str,
    prediction: &Prediction,
) -> Result<PredictionRecord> {
    Ok(PredictionRecord {
        id: prediction.id.clone(),
        filename: frame.filename(),
        endpoint_id: endpoint_id.to_string(),
        captured_at: frame.captured_at,
        label_name: prediction.label_name.clone(),
        label_index: prediction.label_index,
        confidence: prediction.score,
        bboxes: serde_json::to_string(&prediction.bboxes)?,
        event_id: frame.event_id.to_string(),
    })
}
