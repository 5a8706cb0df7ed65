//! Scripted in-memory serial link shared by the integration tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use modrtu::{Result, SerialLink, SerialSettings};

#[derive(Debug, Default)]
pub struct RecorderState {
    pub writes: Vec<Vec<u8>>,
    pub open: bool,
    pub open_count: u32,
    /// Set when a write arrived while the previous response was still
    /// being consumed, i.e. two transactions overlapped on the wire.
    pub overlap_detected: bool,
}

/// Shared view into a [`MockLink`] so a test can assert on traffic after
/// the client has consumed the link.
#[derive(Debug, Clone, Default)]
pub struct LinkRecorder {
    state: Arc<Mutex<RecorderState>>,
}

impl LinkRecorder {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn overlap_detected(&self) -> bool {
        self.state.lock().overlap_detected
    }
}

/// Serial link double that answers every write with the next scripted
/// response. An exhausted script answers with silence, which the engine
/// sees as a timeout.
pub struct MockLink {
    recorder: LinkRecorder,
    script: VecDeque<Vec<u8>>,
    pending: Vec<u8>,
    responding: bool,
}

impl MockLink {
    pub fn new(script: Vec<Vec<u8>>) -> (Self, LinkRecorder) {
        let recorder = LinkRecorder::default();
        let link = Self {
            recorder: recorder.clone(),
            script: script.into(),
            pending: Vec::new(),
            responding: false,
        };
        (link, recorder)
    }

    pub fn boxed(script: Vec<Vec<u8>>) -> (Box<dyn SerialLink>, LinkRecorder) {
        let (link, recorder) = Self::new(script);
        (Box::new(link), recorder)
    }
}

impl SerialLink for MockLink {
    fn open(&mut self, _settings: &SerialSettings) -> Result<()> {
        let mut state = self.recorder.state.lock();
        state.open = true;
        state.open_count += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.recorder.state.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.recorder.state.lock().open
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let mut state = self.recorder.state.lock();
        if self.responding {
            state.overlap_detected = true;
        }
        state.writes.push(bytes.to_vec());
        self.pending = self.script.pop_front().unwrap_or_default();
        self.responding = !self.pending.is_empty();
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize> {
        Ok(self.pending.len())
    }

    fn read_available(&mut self, max: usize) -> Result<Vec<u8>> {
        let take = self.pending.len().min(max);
        let chunk: Vec<u8> = self.pending.drain(..take).collect();
        if self.pending.is_empty() {
            self.responding = false;
        }
        Ok(chunk)
    }

    fn flush_input(&mut self) -> Result<()> {
        // A flush that throws away an unread response means another
        // transaction barged in mid-flight.
        if self.responding && !self.pending.is_empty() {
            self.recorder.state.lock().overlap_detected = true;
        }
        self.pending.clear();
        self.responding = false;
        Ok(())
    }

    fn flush_output(&mut self) -> Result<()> {
        Ok(())
    }
}
