//! Keel snapshot: capture the live managed objects before a forward upgrade so
//! a later rollback can restore them.
//!
//! A snapshot is stored as one Secret in the agent namespace. Its payload is a
//! gzip stream of JSON-encoded objects separated by NUL bytes. The Secret is
//! labeled with the producing process id and is only trusted by that process.

#![forbid(unsafe_code)]

use std::io::{Read, Write};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use keel_core::{Gvk, KindOrder, KubeObject, ObjectRef, PROCESS_ID_LABEL_KEY, UPGRADE_RESOURCE_LABEL_KEY, UPGRADE_RESOURCE_LABEL_VALUE};
use keel_kubehub::UpgradeContext;
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{info, warn};

pub const SNAPSHOT_SECRET_NAME: &str = "sensor-upgrader-snapshot";
const SNAPSHOT_DATA_KEY: &str = "snapshot";

pub fn snapshot_ref(namespace: &str) -> ObjectRef {
    ObjectRef::new(Gvk::new("", "v1", "Secret"), Some(namespace), SNAPSHOT_SECRET_NAME)
}

pub fn encode_objects(objects: &[KubeObject]) -> Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    for (i, obj) in objects.iter().enumerate() {
        if i > 0 {
            enc.write_all(&[0])?;
        }
        serde_json::to_writer(&mut enc, obj).context("encoding snapshot object")?;
    }
    enc.finish().context("compressing snapshot")
}

pub fn decode_objects(bytes: &[u8]) -> Result<Vec<KubeObject>> {
    let mut raw = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut raw).context("decompressing snapshot")?;
    raw.split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .enumerate()
        .map(|(i, chunk)| KubeObject::from_json_slice(chunk).with_context(|| format!("decoding snapshot object {}", i)))
        .collect()
}

/// Build the Secret that holds `objects` for process `process_id`.
pub fn snapshot_secret(namespace: &str, process_id: &str, objects: &[KubeObject]) -> Result<KubeObject> {
    let payload = encode_objects(objects)?;
    KubeObject::from_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "Opaque",
        "metadata": {
            "name": SNAPSHOT_SECRET_NAME,
            "namespace": namespace,
            "labels": {
                UPGRADE_RESOURCE_LABEL_KEY: UPGRADE_RESOURCE_LABEL_VALUE,
                PROCESS_ID_LABEL_KEY: process_id,
            },
        },
        "data": { SNAPSHOT_DATA_KEY: B64.encode(payload) },
    }))
}

fn read_secret(secret: &KubeObject) -> Result<Vec<KubeObject>> {
    let data = secret
        .pointer(&format!("/data/{}", SNAPSHOT_DATA_KEY))
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("snapshot secret has no {:?} entry", SNAPSHOT_DATA_KEY))?;
    let bytes = B64.decode(data).context("snapshot payload is not base64")?;
    decode_objects(&bytes)
}

/// Return the snapshot owned by the current process, taking it if needed.
///
/// An existing snapshot labeled with the current process id is returned as is.
/// Otherwise, with `must_exist` the call fails; without it the live managed
/// objects are listed and, when `store` is set, persisted as the new snapshot.
pub async fn take_or_read_snapshot(ctx: &UpgradeContext, kinds: &KindOrder, must_exist: bool, store: bool) -> Result<Vec<KubeObject>> {
    let t0 = Instant::now();
    let r = snapshot_ref(&ctx.config().namespace);
    let existing = match ctx.get(&r).await {
        Ok(found) => found,
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e).context("reading snapshot secret"),
    };

    if let Some(secret) = &existing {
        if secret.label(PROCESS_ID_LABEL_KEY) == Some(ctx.process_id()) {
            let objects = read_secret(secret).context("reading existing snapshot")?;
            info!(objects = objects.len(), "reusing snapshot taken earlier by this process");
            counter!("upgrader_snapshot_total", 1u64, "outcome" => "reused");
            return Ok(objects);
        }
    }
    if must_exist {
        return Err(anyhow!("no snapshot owned by process {} in {}", ctx.process_id(), r));
    }
    if let Some(secret) = &existing {
        warn!(owner = secret.label(PROCESS_ID_LABEL_KEY).unwrap_or("<none>"), "ignoring snapshot of another process");
    }

    let objects = ctx.list_managed(kinds).await.context("listing live objects for snapshot")?;
    if !store {
        info!(objects = objects.len(), took_ms = %t0.elapsed().as_millis(), "captured live state (not stored)");
        counter!("upgrader_snapshot_total", 1u64, "outcome" => "transient");
        return Ok(objects);
    }

    let mut secret = snapshot_secret(&ctx.config().namespace, ctx.process_id(), &objects)?;
    if let Some(payload) = secret.pointer(&format!("/data/{}", SNAPSHOT_DATA_KEY)).and_then(|v| v.as_str()) {
        histogram!("upgrader_snapshot_bytes", payload.len() as f64);
    }
    match existing.as_ref().and_then(|e| e.resource_version()) {
        Some(rv) => {
            secret.set_resource_version(Some(rv));
            ctx.update(&secret).await.context("replacing snapshot secret")?;
        }
        None => {
            ctx.create(&secret).await.context("storing snapshot secret")?;
        }
    }
    info!(objects = objects.len(), took_ms = %t0.elapsed().as_millis(), "stored snapshot");
    counter!("upgrader_snapshot_total", 1u64, "outcome" => "stored");
    Ok(objects)
}
