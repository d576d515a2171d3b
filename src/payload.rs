//! JSON payloads for the commands the client issues on its own behalf.

use crate::error::{Result, TuyaError};
use crate::protocol::{CommandKind, Version};
use crate::queue::QueueItem;
use serde_json::{Map, Value, json};
use std::time::{SystemTime, UNIX_EPOCH};

const KEY_DPS: &str = "dps";
const KEY_T: &str = "t";
const KEY_DATA: &str = "data";
const KEY_PROTOCOL: &str = "protocol";
const KEY_GW_ID: &str = "gwId";
const KEY_DEV_ID: &str = "devId";
const KEY_UID: &str = "uid";

const QUERY_CONFLICT_KEY: &str = "query";

pub fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn heartbeat(device_id: &str) -> Result<QueueItem> {
    let payload = json!({
        KEY_GW_ID: device_id,
        KEY_DEV_ID: device_id,
    });
    Ok(QueueItem::new(CommandKind::HeartBeat, serde_json::to_vec(&payload)?))
}

/// Status query. Pending queries collapse into the newest one.
pub fn dp_query(device_id: &str, version: Version, t: u64) -> Result<QueueItem> {
    let payload = match version {
        Version::V3_3 => json!({
            KEY_GW_ID: device_id,
            KEY_DEV_ID: device_id,
            KEY_UID: device_id,
            KEY_T: t.to_string(),
        }),
        Version::V3_5 => json!({}),
    };
    Ok(
        QueueItem::new(CommandKind::DpQuery, serde_json::to_vec(&payload)?)
            .with_conflict_key(QUERY_CONFLICT_KEY),
    )
}

/// DP write. `dps` maps DP ids to values, e.g. `{"1": true}`.
pub fn control(device_id: &str, version: Version, dps: Value, t: u64) -> Result<QueueItem> {
    let key = dps_conflict_key(&dps)
        .ok_or_else(|| TuyaError::Json("dps must be a non-empty JSON object".into()))?;

    let mut payload = Map::new();
    match version {
        Version::V3_3 => {
            payload.insert(KEY_DEV_ID.into(), device_id.into());
            payload.insert(KEY_UID.into(), device_id.into());
            payload.insert(KEY_T.into(), t.to_string().into());
            payload.insert(KEY_DPS.into(), dps);
        }
        Version::V3_5 => {
            payload.insert(KEY_PROTOCOL.into(), 5.into());
            payload.insert(KEY_T.into(), t.into());
            payload.insert(KEY_DATA.into(), json!({ KEY_DPS: dps }));
        }
    }
    Ok(
        QueueItem::new(CommandKind::Control, serde_json::to_vec(&Value::Object(payload))?)
            .with_conflict_key(key),
    )
}

/// `dps:<ids>` with the ids sorted, or `None` unless `dps` is a non-empty object.
pub fn dps_conflict_key(dps: &Value) -> Option<String> {
    let obj = dps.as_object().filter(|o| !o.is_empty())?;
    let mut ids: Vec<&str> = obj.keys().map(String::as_str).collect();
    ids.sort_unstable();
    Some(format!("{}:{}", KEY_DPS, ids.join(",")))
}
