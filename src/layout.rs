// src/layout.rs
//
// =============================================================================
// SUNBENCH: PIXEL-QUEUE BUILDER
// =============================================================================
//
// Turns the layout rows of a Request into a channel-keyed PixelQueue.
//
// Rules:
// 1. Absolute position = experiment centre + per-device offset.
// 2. Area -1 means "use the operator override" (`a_ovr_spin`).
// 3. The SMU channel is the index of the device's sort string in the
//    primary SMU's channel mapping (case-insensitive).

use crate::bus::topics;
use crate::core::{DeviceRecord, Experiment, LayoutRow, PixelQueue, Request};
use crate::error::{LabError, LabResult};

/// Area value meaning "custom area".
const CUSTOM_AREA: f64 = -1.0;

pub fn build_queue(request: &Request, experiment: Experiment) -> LabResult<PixelQueue> {
    let args = &request.args;
    let rows = match experiment {
        Experiment::SolarSim => args.iv_devices.as_deref(),
        Experiment::Eqe => args.eqe_devices.as_deref(),
    }
    .unwrap_or_default();

    let mut queue = PixelQueue::new();
    if rows.is_empty() {
        return Ok(queue);
    }

    let center = request
        .config
        .stage
        .experiment_positions
        .get(experiment.key())
        .ok_or_else(|| malformed(format!("no stage position for '{}'", experiment.key())))?;

    let mapping: Vec<String> = request
        .config
        .primary_smu()
        .map(|smu| smu.channel_mapping.iter().map(|s| s.to_lowercase()).collect())
        .unwrap_or_default();

    for row in rows {
        let channel = mapping
            .iter()
            .position(|s| *s == row.sort_string.to_lowercase())
            .ok_or_else(|| {
                malformed(format!(
                    "device '{}' ({}) has no SMU channel",
                    row.device_label, row.sort_string
                ))
            })?;
        queue.insert(channel, device_record(row, center, args.a_ovr_spin));
    }
    Ok(queue)
}

fn device_record(row: &LayoutRow, center: &[f64], area_override: f64) -> DeviceRecord {
    DeviceRecord {
        label: row.label.clone(),
        device_label: row.device_label.clone(),
        layout: row.layout.clone(),
        sub_name: row.system_label.clone(),
        pixel: row.mux_index,
        sort_string: row.sort_string.clone(),
        pos: center.iter().zip(&row.loc).map(|(c, l)| c + l).collect(),
        area: if row.area == CUSTOM_AREA {
            area_override
        } else {
            row.area
        },
        mux_string: row.mux_string.clone(),
    }
}

fn malformed(reason: String) -> LabError {
    LabError::MalformedMessage {
        topic: topics::RUN.into(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(devices: serde_json::Value) -> Request {
        serde_json::from_value(json!({
            "config": {
                "smu": [{"address": "virt", "virtual": true,
                         "channel_mapping": ["A1", "A2", "B1", "B2"]}],
                "stage": {"experiment_positions": {"solarsim": [10.0, 20.0]}}
            },
            "args": {"enable_iv": true, "a_ovr_spin": 0.25, "iv_devices": devices}
        }))
        .unwrap()
    }

    fn row(label: &str, sort: &str, area: f64) -> serde_json::Value {
        json!({
            "label": "sub1", "device_label": label, "layout": "6pix",
            "system_label": "A", "mux_index": 1, "sort_string": sort,
            "loc": [1.5, -2.0], "area": area, "mux_string": format!("s{}", sort)
        })
    }

    #[test]
    fn rows_map_to_channels_positions_and_areas() {
        let req = request(json!([row("dev-b", "b1", 0.15), row("dev-a", "A2", -1.0)]));
        let q = build_queue(&req, Experiment::SolarSim).unwrap();

        // Row order, not channel order
        assert_eq!(q.channels(), vec![2, 1]);
        let a = q.get(1).unwrap();
        assert_eq!(a.device_label, "dev-a");
        assert_eq!(a.area, 0.25);
        assert_eq!(a.pos, vec![11.5, 18.0]);
        assert_eq!(q.get(2).unwrap().area, 0.15);
        assert_eq!(q.live_labels(), vec!["dev-b", "dev-a"]);
        assert_eq!(q.first_area(), Some(0.15));
    }

    #[test]
    fn pruning_keeps_the_remaining_row_order() {
        let req = request(json!([
            row("dev-c", "B2", 0.3),
            row("dev-a", "A1", 0.1),
            row("dev-b", "B1", 0.2)
        ]));
        let mut q = build_queue(&req, Experiment::SolarSim).unwrap();
        assert_eq!(q.remove(3).unwrap().device_label, "dev-c");
        assert!(q.remove(3).is_none());
        assert_eq!(q.channels(), vec![0, 2]);
        assert_eq!(q.first_area(), Some(0.1));
    }

    #[test]
    fn missing_experiment_rows_give_an_empty_queue() {
        let req = request(json!([row("dev-a", "A1", 0.1)]));
        assert!(build_queue(&req, Experiment::Eqe).unwrap().is_empty());
    }

    #[test]
    fn unmapped_sort_string_is_malformed() {
        let req = request(json!([row("dev-z", "Z9", 0.1)]));
        let err = build_queue(&req, Experiment::SolarSim).unwrap_err();
        assert!(matches!(err, LabError::MalformedMessage { .. }));
    }
}
