//! Reading raw sensor logs and writing estimated trajectories.
//!
//! Raw logs are plain numeric tables: one record per line, fields separated by a single-byte
//! delimiter (space by default, repeats collapse), lines whose first non-blank character is `%` are
//! comments, and the first field of every record is its timestamp. Trajectories are written as CSV with a header.
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::STATE_SIZE;
use crate::config::LogPaths;
use crate::error::{OdometryError, Result};
use crate::fusion::{PositionFixSample, Trajectory, TrajectoryEntry};
use crate::stream::{ExhaustionPolicy, SensorKind, SensorStream, StreamMultiplexer};

pub const COMMENT: u8 = b'%';

fn delimiter_byte(delimiter: char) -> Result<u8> {
    if delimiter.is_ascii() && delimiter != '\n' && delimiter as u8 != COMMENT {
        Ok(delimiter as u8)
    } else {
        Err(OdometryError::Config(format!(
            "unusable log delimiter {delimiter:?}"
        )))
    }
}

/// Parse delimited numeric rows from any reader.
///
/// `max_rows` limits the number of data rows returned. Comment and blank lines do not count
/// towards it.
pub fn read_rows<R: Read>(
    reader: R,
    delimiter: char,
    max_rows: Option<usize>,
) -> Result<Vec<Vec<f64>>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .delimiter(delimiter_byte(delimiter)?)
        .comment(Some(COMMENT))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let limit = max_rows.unwrap_or(usize::MAX);
    let mut rows = Vec::new();
    for result in rdr.records() {
        if rows.len() >= limit {
            break;
        }
        let record = result?;
        let mut fields = record.iter().filter(|field| !field.is_empty()).peekable();
        // Indented comments get past the reader's own first-byte check.
        if fields.peek().is_some_and(|f| f.starts_with(COMMENT as char)) {
            continue;
        }
        let line = record.position().map_or(0, |p| p.line());
        let row = fields
            .map(|field| {
                field.parse::<f64>().map_err(|_| OdometryError::MalformedRecord {
                    record: format!("line {line}"),
                    reason: format!("non-numeric field {field:?}"),
                })
            })
            .collect::<Result<Vec<f64>>>()?;
        if !row.is_empty() {
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Read all numeric rows from a log file.
pub fn read_log<P: AsRef<Path>>(
    path: P,
    delimiter: char,
    max_rows: Option<usize>,
) -> Result<Vec<Vec<f64>>> {
    let path = path.as_ref();
    let rows = read_rows(File::open(path)?, delimiter, max_rows)?;
    debug!("Read {} rows from {}", rows.len(), path.display());
    Ok(rows)
}

/// Write numeric rows in the raw log format, optionally preceded by a comment line.
pub fn write_rows<W: Write>(
    writer: W,
    rows: &[Vec<f64>],
    delimiter: char,
    comment: Option<&str>,
) -> Result<()> {
    let mut writer = writer;
    if let Some(text) = comment {
        writeln!(writer, "{} {text}", COMMENT as char)?;
    }
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .delimiter(delimiter_byte(delimiter)?)
        .flexible(true)
        .from_writer(writer);
    for row in rows {
        wtr.write_record(row.iter().map(|v| v.to_string()))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_log<P: AsRef<Path>>(
    path: P,
    rows: &[Vec<f64>],
    delimiter: char,
    comment: Option<&str>,
) -> Result<()> {
    write_rows(File::create(path)?, rows, delimiter, comment)
}

/// Load one log into a time-sorted stream.
pub fn load_stream<P: AsRef<Path>>(kind: SensorKind, path: P, logs: &LogPaths) -> Result<SensorStream> {
    let rows = read_log(path, logs.delimiter, logs.max_rows)?;
    SensorStream::new(kind, rows)
}

/// Load every configured log and register it with a multiplexer.
///
/// Streams are added in [`SensorKind::ALL`] order, so velocity wins timestamp ties, then
/// orientation, position fix and scan.
pub fn load_streams(logs: &LogPaths, policy: ExhaustionPolicy) -> Result<StreamMultiplexer> {
    let mut mux = StreamMultiplexer::new(policy);
    for kind in SensorKind::ALL {
        if let Some(path) = logs.path(kind) {
            let stream = load_stream(kind, path, logs)?;
            info!("Loaded {} {kind} records from {}", stream.len(), path.display());
            mux.add_stream(stream)?;
        }
    }
    if mux.remaining() == 0 {
        return Err(OdometryError::Config("no sensor records to fuse".to_string()));
    }
    Ok(mux)
}

/// One row of a trajectory CSV: the state and its one-sigma bounds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f64,
    pub u: f64,
    pub v: f64,
    pub w: f64,
    pub r: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    pub sigma_z: f64,
    pub sigma_yaw: f64,
    pub sigma_u: f64,
    pub sigma_v: f64,
    pub sigma_w: f64,
    pub sigma_r: f64,
}

impl From<&TrajectoryEntry> for TrajectoryRecord {
    fn from(entry: &TrajectoryEntry) -> Self {
        let s = &entry.state;
        let sigma: Vec<f64> = (0..STATE_SIZE)
            .map(|i| entry.covariance[(i, i)].max(0.0).sqrt())
            .collect();
        TrajectoryRecord {
            time: entry.timestamp,
            x: s[0],
            y: s[1],
            z: s[2],
            yaw: s[3],
            u: s[4],
            v: s[5],
            w: s[6],
            r: s[7],
            sigma_x: sigma[0],
            sigma_y: sigma[1],
            sigma_z: sigma[2],
            sigma_yaw: sigma[3],
            sigma_u: sigma[4],
            sigma_v: sigma[5],
            sigma_w: sigma[6],
            sigma_r: sigma[7],
        }
    }
}

impl TrajectoryRecord {
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Write a trajectory with its one-sigma columns.
pub fn write_trajectory<P: AsRef<Path>>(trajectory: &Trajectory, path: P) -> io::Result<()> {
    let records: Vec<TrajectoryRecord> = trajectory.entries().iter().map(Into::into).collect();
    TrajectoryRecord::to_csv(&records, path)
}

/// Write projected position fixes as `time,x,y`.
pub fn write_position_fixes<P: AsRef<Path>>(fixes: &[PositionFixSample], path: P) -> io::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["time", "x", "y"])?;
    for fix in fixes {
        writer.write_record([fix.timestamp, fix.x, fix.y].map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalman::Estimate;
    use nalgebra::{DMatrix, DVector};
    use tempfile::tempdir;

    #[test]
    fn comments_and_repeated_delimiters() {
        let text = "% header line\n1.0  2.0   3.0\n\n% another\n2.0 4.5 -1e-3\n";
        let rows = read_rows(text.as_bytes(), ' ', None).unwrap();
        assert_eq!(rows, vec![vec![1.0, 2.0, 3.0], vec![2.0, 4.5, -1e-3]]);
    }

    #[test]
    fn indented_comments_are_skipped() {
        let text = "   % indented comment\n1 2\n\t% tabbed comment\n3 4\n";
        let rows = read_rows(text.as_bytes(), ' ', None).unwrap();
        assert_eq!(rows, vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        let rows = read_rows("1,2\n  ,% note\n3,4\n".as_bytes(), ',', None).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn max_rows_limits_the_read() {
        let text = "1 1\n2 2\n3 3\n4 4\n";
        let rows = read_rows(text.as_bytes(), ' ', Some(2)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec![2.0, 2.0]);
    }

    #[test]
    fn max_rows_counts_data_rows_only() {
        let text = "% one\n% two\n  % three\n1 1\n\n2 2\n3 3\n";
        let rows = read_rows(text.as_bytes(), ' ', Some(2)).unwrap();
        assert_eq!(rows, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
    }

    #[test]
    fn other_delimiters() {
        let rows = read_rows("1,2,3\n4,5,6\n".as_bytes(), ',', None).unwrap();
        assert_eq!(rows[1], vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn non_numeric_fields_are_rejected() {
        let err = read_rows("1 2 3\n4 five 6\n".as_bytes(), ' ', None).unwrap_err();
        match err {
            OdometryError::MalformedRecord { reason, .. } => assert!(reason.contains("five")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn write_then_load_streams() {
        let dir = tempdir().unwrap();
        let mut logs = LogPaths::default();
        let velocity = dir.path().join("velocity.log");
        let scan = dir.path().join("scan.log");
        write_log(&velocity, &[vec![2.0, 0.5], vec![0.0, 0.25]], ' ', Some("t v")).unwrap();
        write_log(&scan, &[vec![1.0]], ' ', None).unwrap();
        logs.set_path(SensorKind::Velocity, velocity);
        logs.set_path(SensorKind::Scan, scan);

        let mux = load_streams(&logs, ExhaustionPolicy::DrainRemaining).unwrap();
        let order: Vec<(SensorKind, f64)> = mux.map(|r| (r.kind, r.timestamp())).collect();
        assert_eq!(
            order,
            vec![
                (SensorKind::Velocity, 0.0),
                (SensorKind::Scan, 1.0),
                (SensorKind::Velocity, 2.0)
            ]
        );
    }

    #[test]
    fn no_logs_is_a_config_error() {
        let err = load_streams(&LogPaths::default(), ExhaustionPolicy::DrainRemaining).unwrap_err();
        assert!(matches!(err, OdometryError::Config(_)));
    }

    #[test]
    fn trajectory_csv_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trajectory.csv");
        let mut trajectory = Trajectory::default();
        let estimate = Estimate {
            state: DVector::from_vec(vec![1.0, 2.0, 3.0, 0.5, 1.0, 0.0, 0.0, 0.1]),
            covariance: DMatrix::from_diagonal(&DVector::from_element(STATE_SIZE, 4.0)),
        };
        trajectory.push(3.5, &estimate);
        write_trajectory(&trajectory, &path).unwrap();

        let records = TrajectoryRecord::from_csv(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].time, 3.5);
        assert_eq!(records[0].yaw, 0.5);
        assert_eq!(records[0].sigma_r, 2.0);
    }
}
