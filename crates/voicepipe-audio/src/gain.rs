use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

// ── GainNode ──────────────────────────────────────────────────

/// Live output gain shared by every voice scheduled through it.
///
/// All fields are atomics so the audio thread can read the current level
/// without locking. Volume changes never touch buffered samples; they are
/// applied here at render time.
pub struct GainNode {
    volume_bits: AtomicU32,
    muted: AtomicBool,
    fading: AtomicBool,
    fade_start_bits: AtomicU64,
    fade_end_bits: AtomicU64,
    disconnected: AtomicBool,
}

impl GainNode {
    pub fn new(volume: f32, muted: bool) -> Self {
        Self {
            volume_bits: AtomicU32::new(volume.clamp(0.0, 1.0).to_bits()),
            muted: AtomicBool::new(muted),
            fading: AtomicBool::new(false),
            fade_start_bits: AtomicU64::new(0f64.to_bits()),
            fade_end_bits: AtomicU64::new(0f64.to_bits()),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, v: f32) {
        self.volume_bits
            .store(v.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, m: bool) {
        self.muted.store(m, Ordering::Relaxed);
    }

    /// Linearly ramp the gain to zero between `start` and `start + duration`
    /// (clock seconds).
    pub fn fade_out(&self, start: f64, duration: f64) {
        self.fade_start_bits.store(start.to_bits(), Ordering::Relaxed);
        self.fade_end_bits
            .store((start + duration.max(0.0)).to_bits(), Ordering::Relaxed);
        self.fading.store(true, Ordering::Release);
    }

    pub fn is_fading(&self) -> bool {
        self.fading.load(Ordering::Acquire)
    }

    /// Detach every voice bound to this node. Terminal.
    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Effective gain at clock time `t`.
    pub fn level_at(&self, t: f64) -> f32 {
        if self.is_disconnected() || self.is_muted() {
            return 0.0;
        }
        let volume = self.volume();
        if !self.is_fading() {
            return volume;
        }
        let start = f64::from_bits(self.fade_start_bits.load(Ordering::Relaxed));
        let end = f64::from_bits(self.fade_end_bits.load(Ordering::Relaxed));
        if t <= start {
            volume
        } else if t >= end || end <= start {
            0.0
        } else {
            let remaining = (end - t) / (end - start);
            volume * remaining as f32
        }
    }
}

impl Default for GainNode {
    fn default() -> Self {
        Self::new(1.0, false)
    }
}

impl std::fmt::Debug for GainNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GainNode")
            .field("volume", &self.volume())
            .field("muted", &self.is_muted())
            .field("fading", &self.is_fading())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}
