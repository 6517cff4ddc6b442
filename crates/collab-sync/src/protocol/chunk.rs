//! Splitting of join responses that do not fit in one transport message.
//!
//! A response that fits is sent as a single `sync`. Otherwise the stream is:
//! snapshot slices (`sync_snapshot_chunk`), operations packed greedily in
//! order (`sync_ops_chunk`), oversized operations split into
//! `sync_op_fragment`s, and a closing `sync_complete` carrying the counts.

use serde::Serialize;

use super::ServerMessage;
use crate::error::{SyncError, SyncResult};

/// Bytes reserved for the JSON envelope around a data slice
pub const ENVELOPE_HEADROOM: usize = 512;

/// Borrowed shape of `ServerMessage::Sync`, to measure it without cloning
#[derive(Serialize)]
struct SyncView<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    snapshot: Option<&'a str>,
    ops: &'a [String],
    version: Option<i64>,
}

/// Turn a join response into the message sequence to push, in order.
///
/// Payloads are base64 text, so slicing on byte boundaries is safe, and
/// slices are multiples of four characters so each one decodes on its own.
pub fn plan_sync_messages(
    snapshot: Option<String>,
    ops: Vec<String>,
    version: Option<i64>,
    max_bytes: usize,
) -> SyncResult<Vec<ServerMessage>> {
    let whole = SyncView {
        kind: "sync",
        snapshot: snapshot.as_deref(),
        ops: &ops,
        version,
    };
    if serde_json::to_vec(&whole)?.len() <= max_bytes {
        return Ok(vec![ServerMessage::Sync {
            snapshot,
            ops,
            version,
        }]);
    }

    let slice_len = (max_bytes.saturating_sub(ENVELOPE_HEADROOM) / 4) * 4;
    if slice_len == 0 {
        return Err(SyncError::Internal(format!(
            "message ceiling of {} bytes leaves no room for payload",
            max_bytes
        )));
    }

    let mut messages = Vec::new();

    let snapshot_chunks = snapshot
        .as_deref()
        .map(|s| slices(s, slice_len))
        .unwrap_or_default();
    let snapshot_chunk_count = snapshot_chunks.len();
    for (chunk_index, data) in snapshot_chunks.into_iter().enumerate() {
        messages.push(ServerMessage::SyncSnapshotChunk {
            chunk_index,
            chunk_count: snapshot_chunk_count,
            data,
        });
    }

    let op_count = ops.len();
    let mut packer = OpsPacker::new(op_count, max_bytes, slice_len)?;
    for (index, op) in ops.into_iter().enumerate() {
        packer.push(index, op, &mut messages);
    }
    packer.flush(&mut messages);

    messages.push(ServerMessage::SyncComplete {
        version,
        snapshot_chunk_count,
        op_count,
        ops_sent: packer.ops_sent,
    });

    Ok(messages)
}

/// Greedy in-order packing of operation payloads into bounded batches
struct OpsPacker {
    max_bytes: usize,
    slice_len: usize,
    /// Encoded size of an empty `sync_ops_chunk`, with the widest start index
    base_len: usize,
    batch: Vec<String>,
    batch_start: usize,
    batch_len: usize,
    ops_sent: usize,
}

impl OpsPacker {
    fn new(op_count: usize, max_bytes: usize, slice_len: usize) -> SyncResult<Self> {
        let base_len = serde_json::to_vec(&ServerMessage::SyncOpsChunk {
            start_index: op_count,
            ops: Vec::new(),
        })?
        .len();

        Ok(Self {
            max_bytes,
            slice_len,
            base_len,
            batch: Vec::new(),
            batch_start: 0,
            batch_len: base_len,
            ops_sent: 0,
        })
    }

    fn push(&mut self, index: usize, op: String, out: &mut Vec<ServerMessage>) {
        // Two quotes plus a separating comma; base64 never needs escaping
        let entry_len = op.len() + 3;

        if self.base_len + entry_len > self.max_bytes {
            self.flush(out);
            let fragments = slices(&op, self.slice_len);
            let fragment_count = fragments.len();
            for (fragment_index, data) in fragments.into_iter().enumerate() {
                out.push(ServerMessage::SyncOpFragment {
                    op_index: index,
                    fragment_index,
                    fragment_count,
                    data,
                });
            }
            self.ops_sent += 1;
            return;
        }

        if self.batch_len + entry_len > self.max_bytes {
            self.flush(out);
        }
        if self.batch.is_empty() {
            self.batch_start = index;
            self.batch_len = self.base_len;
        }
        self.batch.push(op);
        self.batch_len += entry_len;
    }

    fn flush(&mut self, out: &mut Vec<ServerMessage>) {
        if self.batch.is_empty() {
            return;
        }
        let ops = std::mem::take(&mut self.batch);
        self.ops_sent += ops.len();
        out.push(ServerMessage::SyncOpsChunk {
            start_index: self.batch_start,
            ops,
        });
        self.batch_len = self.base_len;
    }
}

fn slices(data: &str, slice_len: usize) -> Vec<String> {
    data.as_bytes()
        .chunks(slice_len)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}
