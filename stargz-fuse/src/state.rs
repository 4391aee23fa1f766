//! Per-layer health surface.
//!
//! Every mounted layer carries one synthetic stat file whose contents are
//! re-rendered on each read: the layer digest, blob size, fetch progress
//! and the last error any node reported. The blob URL is deliberately not
//! part of the rendering.

use std::sync::Mutex;

pub struct LayerState {
    digest: String,
    size: u64,
    fetched: Box<dyn Fn() -> u64 + Send + Sync>,
    last_error: Mutex<String>,
}

impl LayerState {
    pub fn new(digest: String, size: u64, fetched: Box<dyn Fn() -> u64 + Send + Sync>) -> Self {
        Self {
            digest,
            size,
            fetched,
            last_error: Mutex::new(String::new()),
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Name of the stat file within the state directory.
    pub fn stat_file_name(&self) -> String {
        format!("{}.json", self.digest)
    }

    /// Remember the most recent read failure for out-of-band observation.
    pub fn record_error(&self, err: &dyn std::fmt::Display) {
        *self.last_error.lock().unwrap() = err.to_string();
    }

    /// Render the current health document, one JSON object plus newline.
    pub fn render(&self) -> Vec<u8> {
        let fetched = (self.fetched)();
        let percent = if self.size == 0 {
            100.0
        } else {
            fetched as f64 / self.size as f64 * 100.0
        };
        let doc = serde_json::json!({
            "error": self.last_error.lock().unwrap().clone(),
            "digest": self.digest,
            "size": self.size,
            "fetchedSize": fetched,
            "fetchedPercent": percent,
        });
        let mut out = serde_json::to_vec(&doc).unwrap();
        out.push(b'\n');
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_render_shape() {
        let state = LayerState::new("sha256:abcd".into(), 200, Box::new(|| 50));
        let doc: serde_json::Value = serde_json::from_slice(&state.render()).unwrap();
        assert_eq!(doc["digest"], "sha256:abcd");
        assert_eq!(doc["size"], 200);
        assert_eq!(doc["fetchedSize"], 50);
        assert_eq!(doc["fetchedPercent"], 25.0);
        assert_eq!(doc["error"], "");

        state.record_error(&"read failed");
        let doc: serde_json::Value = serde_json::from_slice(&state.render()).unwrap();
        assert_eq!(doc["error"], "read failed");
    }
}
