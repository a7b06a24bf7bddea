use std::sync::Arc;

use crate::timestamp::TIMESTAMP_MASK;

/// Shared handle to an immutable event.
///
/// A cache cell and any number of query results may hold the same event; it
/// is freed when the last handle drops.
pub type EventRef = Arc<Event>;

/// Local motion estimate attached to an event by an upstream flow stage.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Flow {
    pub vx: f64,
    pub vy: f64,
}

impl Flow {
    pub fn new(vx: f64, vy: f64) -> Self {
        Self { vx, vy }
    }

    pub fn magnitude(&self) -> f64 {
        self.vx.hypot(self.vy)
    }

    /// Unit motion direction, or `None` for a zero vector.
    pub fn direction(&self) -> Option<(f64, f64)> {
        let m = self.magnitude();
        if m > 0.0 && m.is_finite() {
            Some((self.vx / m, self.vy / m))
        } else {
            None
        }
    }
}

/// Single address event from the camera.
///
/// `timestamp` is the 24-bit wrapping sensor counter; compare stamps with
/// [`crate::timestamp`], never by raw subtraction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Event {
    pub x: u16,
    pub y: u16,
    pub timestamp: u32,
    /// ON (`true`) or OFF (`false`).
    pub polarity: bool,
    /// Sensor channel, 0 (left) or 1 (right).
    pub channel: u8,
    /// Present on flow-tagged events.
    pub flow: Option<Flow>,
}

impl Event {
    pub fn new(x: u16, y: u16, timestamp: u32, polarity: bool) -> Self {
        Self {
            x,
            y,
            timestamp: timestamp & TIMESTAMP_MASK,
            polarity,
            channel: 0,
            flow: None,
        }
    }

    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel & 1;
        self
    }

    pub fn with_flow(mut self, vx: f64, vy: f64) -> Self {
        self.flow = Some(Flow::new(vx, vy));
        self
    }

    pub fn is_flow(&self) -> bool {
        self.flow.is_some()
    }

    /// Wrap into a shared handle.
    pub fn into_ref(self) -> EventRef {
        Arc::new(self)
    }

    /// Decode one timestamp word followed by one address word.
    ///
    /// Timestamp word: bit 31 type tag, bits 0..24 timestamp.
    /// Address word: bit 0 polarity, bits 1..8 x, bits 8..15 y, bit 15 channel.
    /// Returns `None` when the timestamp word lacks its tag.
    pub fn decode(ts_word: u32, addr_word: u32) -> Option<Self> {
        if ts_word & TIMESTAMP_TAG == 0 {
            return None;
        }
        let polarity = addr_word & 1 == 1;
        let x = ((addr_word >> 1) & 0x7F) as u16;
        let y = ((addr_word >> 8) & 0x7F) as u16;
        let channel = ((addr_word >> 15) & 1) as u8;
        Some(Event::new(x, y, ts_word & TIMESTAMP_MASK, polarity).with_channel(channel))
    }

    /// Encode as `(timestamp word, address word)`.
    ///
    /// Returns `None` if x or y does not fit the 7-bit address fields.
    pub fn encode(&self) -> Option<(u32, u32)> {
        if self.x > 0x7F || self.y > 0x7F {
            return None;
        }
        let ts_word = TIMESTAMP_TAG | (self.timestamp & TIMESTAMP_MASK);
        let addr_word = (self.polarity as u32)
            | ((self.x as u32) << 1)
            | ((self.y as u32) << 8)
            | (((self.channel & 1) as u32) << 15);
        Some((ts_word, addr_word))
    }
}

const TIMESTAMP_TAG: u32 = 1 << 31;

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.x, self.y, self.timestamp, self.polarity as u8
        )
    }
}
