//! Sensor streams and the time-ordered multiplexer.
//!
//! Each sensor log becomes a [`SensorStream`]: a timestamp-sorted sequence of raw rows with a read
//! cursor. The [`StreamMultiplexer`] merges any number of streams into one causally ordered sequence
//! by always returning the record with the smallest pending timestamp.
//!
//! # Exhaustion
//!
//! What happens when a stream runs out is an [`ExhaustionPolicy`]:
//!
//! - [`ExhaustionPolicy::DrainRemaining`] keeps merging the remaining streams and raises
//!   [`OdometryError::StreamExhausted`] once every stream is empty.
//! - [`ExhaustionPolicy::StopAtFirst`] raises it as soon as any one stream has no records left,
//!   leaving the other streams' unread records undrained.
use std::fmt::{self, Display};
use std::str::FromStr;

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::{OdometryError, Result};

/// Closed set of sensor kinds the fusion loop understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// Doppler velocity log
    Velocity,
    /// Attitude and heading sensor
    Orientation,
    /// Satellite position fix
    PositionFix,
    /// Timestamp-only stream (e.g. imaging sonar scans) that only advances time
    Scan,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Velocity,
        SensorKind::Orientation,
        SensorKind::PositionFix,
        SensorKind::Scan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Velocity => "velocity",
            SensorKind::Orientation => "orientation",
            SensorKind::PositionFix => "position_fix",
            SensorKind::Scan => "scan",
        }
    }

    /// True for kinds whose records are folded into the filter as corrections.
    pub fn carries_correction(&self) -> bool {
        matches!(self, SensorKind::Velocity | SensorKind::Orientation)
    }
}

impl Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = OdometryError;
    fn from_str(s: &str) -> Result<Self> {
        SensorKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| OdometryError::Config(format!("unknown sensor kind '{s}'")))
    }
}

/// One logged row tagged with the sensor that produced it. `fields[0]` is the timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct RawRecord {
    pub kind: SensorKind,
    pub fields: Vec<f64>,
}

impl RawRecord {
    pub fn new(kind: SensorKind, fields: Vec<f64>) -> Self {
        RawRecord { kind, fields }
    }

    pub fn timestamp(&self) -> f64 {
        self.fields.first().copied().unwrap_or(f64::NAN)
    }
}

/// Timestamp-sorted rows of one sensor with a read cursor.
#[derive(Clone, Debug)]
pub struct SensorStream {
    kind: SensorKind,
    rows: Vec<Vec<f64>>,
    cursor: usize,
}

impl SensorStream {
    /// Build a stream, rejecting rows without a finite timestamp.
    ///
    /// Rows are stably sorted by timestamp, so records logged at the same instant keep their order.
    pub fn new(kind: SensorKind, mut rows: Vec<Vec<f64>>) -> Result<Self> {
        for (i, row) in rows.iter().enumerate() {
            match row.first() {
                Some(t) if t.is_finite() => {}
                _ => {
                    return Err(OdometryError::MalformedRecord {
                        record: kind.to_string(),
                        reason: format!("row {i} has no finite timestamp"),
                    });
                }
            }
        }
        rows.sort_by(|a, b| a[0].total_cmp(&b[0]));
        Ok(SensorStream {
            kind,
            rows,
            cursor: 0,
        })
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Records not yet read.
    pub fn remaining(&self) -> usize {
        self.rows.len() - self.cursor
    }

    /// Timestamp of the record under the cursor.
    pub fn peek_timestamp(&self) -> Option<f64> {
        self.rows.get(self.cursor).map(|row| row[0])
    }
}

impl Iterator for SensorStream {
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        let row = self.rows.get(self.cursor)?.clone();
        self.cursor += 1;
        Some(RawRecord::new(self.kind, row))
    }
}

/// What the multiplexer does once a stream has no records left.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Continue with the remaining streams until all are empty
    #[default]
    DrainRemaining,
    /// Stop as soon as any stream is empty
    StopAtFirst,
}

/// Merges sensor streams by timestamp.
#[derive(Clone, Debug, Default)]
pub struct StreamMultiplexer {
    streams: Vec<SensorStream>,
    /// Cached next timestamp per stream, refreshed after every advance
    pending: Vec<Option<f64>>,
    policy: ExhaustionPolicy,
    halted: bool,
}

impl StreamMultiplexer {
    pub fn new(policy: ExhaustionPolicy) -> Self {
        StreamMultiplexer {
            policy,
            ..Default::default()
        }
    }

    /// Register a stream. Each sensor kind may be added once; ties between equal timestamps go to
    /// the stream added first.
    pub fn add_stream(&mut self, stream: SensorStream) -> Result<()> {
        if self.streams.iter().any(|s| s.kind() == stream.kind()) {
            return Err(OdometryError::DuplicateStream(stream.kind()));
        }
        debug!("Registered {} stream with {} records", stream.kind(), stream.len());
        self.pending.push(stream.peek_timestamp());
        self.streams.push(stream);
        Ok(())
    }

    pub fn with_stream(mut self, stream: SensorStream) -> Result<Self> {
        self.add_stream(stream)?;
        Ok(self)
    }

    pub fn policy(&self) -> ExhaustionPolicy {
        self.policy
    }

    /// Records not yet returned, across all streams.
    pub fn remaining(&self) -> usize {
        self.streams.iter().map(SensorStream::remaining).sum()
    }

    /// Return the pending record with the smallest timestamp and advance its stream.
    ///
    /// Raises [`OdometryError::StreamExhausted`] according to the exhaustion policy; once raised,
    /// every later call raises it too.
    pub fn next_record(&mut self) -> Result<RawRecord> {
        if self.halted {
            return Err(OdometryError::StreamExhausted);
        }
        if self.policy == ExhaustionPolicy::StopAtFirst
            && (self.streams.is_empty() || self.pending.iter().any(Option::is_none))
        {
            return self.halt();
        }

        let mut selected: Option<(usize, f64)> = None;
        for (i, pending) in self.pending.iter().enumerate() {
            if let Some(t) = *pending {
                match selected {
                    Some((_, best)) if t >= best => {}
                    _ => selected = Some((i, t)),
                }
            }
        }
        let Some((index, _)) = selected else {
            return self.halt();
        };

        let stream = &mut self.streams[index];
        let record = stream.next().ok_or(OdometryError::StreamExhausted)?;
        self.pending[index] = stream.peek_timestamp();
        trace!("Next record: {} at {:.3}", record.kind, record.timestamp());
        Ok(record)
    }

    fn halt(&mut self) -> Result<RawRecord> {
        if !self.halted {
            debug!(
                "Multiplexer exhausted with {} unread records ({:?})",
                self.remaining(),
                self.policy
            );
        }
        self.halted = true;
        Err(OdometryError::StreamExhausted)
    }
}

impl Iterator for StreamMultiplexer {
    type Item = RawRecord;

    fn next(&mut self) -> Option<RawRecord> {
        self.next_record().ok()
    }
}
