//! Sample and sensor persistence contract
//!
//! Persistence proper belongs to an external collaborator; the station
//! only emits append-only records and asks one query back (the
//! reference dump that `write_invert` inverts). Two implementations
//! ship: an in-memory store for tests and a JSON-lines file store whose
//! rows carry the platform's canonical columns: `uid`, `board_kind`,
//! `pic`, `address` (absolute, `0x…`), `data` (comma-separated byte
//! values) and `created_at`.

use crate::error::{Error, Result};
use crate::packet::{block_address, DATA_SIZE, SRAM_BASE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// One captured SRAM block.
#[derive(Debug, Clone, Serialize)]
pub struct SampleRecord {
    pub uid: String,
    pub board_kind: String,
    pub pic: u8,
    pub block_offset: u32,
    pub payload: Vec<u8>,
    pub captured_at: DateTime<Utc>,
}

/// One telemetry capture. Raw and calibration words are preserved;
/// conversion to physical units is the consumer's business.
#[derive(Debug, Clone, Serialize)]
pub struct SensorRecord {
    pub uid: String,
    pub board_kind: String,
    pub temperature_raw: u16,
    pub voltage_raw: u16,
    pub temp30_cal: u16,
    pub temp110_cal: u16,
    pub vdd_cal: u16,
    pub captured_at: DateTime<Utc>,
}

impl SensorRecord {
    /// Working temperature in degrees Celsius via the two-point factory
    /// calibration. `None` when the calibration words are missing.
    pub fn temperature_celsius(&self) -> Option<f64> {
        if self.temp110_cal == self.temp30_cal {
            return None;
        }
        let slope = 80.0 / (self.temp110_cal as f64 - self.temp30_cal as f64);
        Some(slope * (self.temperature_raw as f64 - self.temp30_cal as f64) + 30.0)
    }

    /// Working supply voltage in volts. `None` without a usable raw
    /// reading.
    pub fn vdd_volts(&self) -> Option<f64> {
        if self.voltage_raw == 0 {
            return None;
        }
        Some(3300.0 * self.vdd_cal as f64 / self.voltage_raw as f64 * 0.001)
    }
}

/// Append-only record sink plus the one query the station needs.
pub trait SampleStore: Send {
    fn append_sample(&mut self, sample: &SampleRecord) -> Result<()>;

    fn append_sensor(&mut self, sensor: &SensorRecord) -> Result<()>;

    /// Earliest captured block per offset in `[0, blocks)` for a device.
    /// The result may be shorter than `blocks` (partial reference) or
    /// empty (no reference at all).
    fn reference_dump(&self, uid: &str, blocks: u32) -> Result<Vec<SampleRecord>>;
}

fn earliest_per_offset(samples: &[SampleRecord], uid: &str, blocks: u32) -> Vec<SampleRecord> {
    let mut reference: Vec<SampleRecord> = Vec::new();
    for offset in 0..blocks {
        let earliest = samples
            .iter()
            .filter(|s| s.uid == uid && s.block_offset == offset)
            .min_by_key(|s| s.captured_at);
        if let Some(sample) = earliest {
            reference.push(sample.clone());
        }
    }
    reference
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    samples: Vec<SampleRecord>,
    sensors: Vec<SensorRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn samples(&self) -> &[SampleRecord] {
        &self.samples
    }

    pub fn sensors(&self) -> &[SensorRecord] {
        &self.sensors
    }
}

impl SampleStore for MemoryStore {
    fn append_sample(&mut self, sample: &SampleRecord) -> Result<()> {
        self.samples.push(sample.clone());
        Ok(())
    }

    fn append_sensor(&mut self, sensor: &SensorRecord) -> Result<()> {
        self.sensors.push(sensor.clone());
        Ok(())
    }

    fn reference_dump(&self, uid: &str, blocks: u32) -> Result<Vec<SampleRecord>> {
        Ok(earliest_per_offset(&self.samples, uid, blocks))
    }
}

#[derive(Serialize, Deserialize)]
struct SampleRow {
    table: String,
    uid: String,
    board_kind: String,
    pic: u8,
    address: String,
    data: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct SensorRow {
    table: String,
    uid: String,
    board_kind: String,
    temperature_raw: u16,
    voltage_raw: u16,
    temp30_cal: u16,
    temp110_cal: u16,
    vdd_cal: u16,
    created_at: DateTime<Utc>,
}

/// JSON-lines file store. Existing sample rows are indexed at open so
/// reference queries work across restarts.
pub struct JsonlStore {
    file: File,
    samples: Vec<SampleRecord>,
}

impl JsonlStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut samples = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SampleRow>(&line) {
                    Ok(row) if row.table == "sample" => match Self::row_to_sample(&row) {
                        Ok(sample) => samples.push(sample),
                        Err(e) => log::warn!("Skipping unreadable sample row: {}", e),
                    },
                    _ => {}
                }
            }
            log::info!("Indexed {} samples from {}", samples.len(), path.display());
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(JsonlStore { file, samples })
    }

    fn row_to_sample(row: &SampleRow) -> Result<SampleRecord> {
        let address = u32::from_str_radix(row.address.trim_start_matches("0x"), 16)
            .map_err(|e| Error::Other(format!("Bad sample address {}: {}", row.address, e)))?;
        let payload = row
            .data
            .split(',')
            .filter(|t| !t.is_empty())
            .map(|t| {
                t.parse::<u8>()
                    .map_err(|e| Error::Other(format!("Bad sample byte {}: {}", t, e)))
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(SampleRecord {
            uid: row.uid.clone(),
            board_kind: row.board_kind.clone(),
            pic: row.pic,
            block_offset: (address - SRAM_BASE) / DATA_SIZE as u32,
            payload,
            captured_at: row.created_at,
        })
    }

    fn write_row<T: Serialize>(&mut self, row: &T) -> Result<()> {
        let line = serde_json::to_string(row)?;
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;
        Ok(())
    }
}

impl SampleStore for JsonlStore {
    fn append_sample(&mut self, sample: &SampleRecord) -> Result<()> {
        let row = SampleRow {
            table: "sample".to_string(),
            uid: sample.uid.clone(),
            board_kind: sample.board_kind.clone(),
            pic: sample.pic,
            address: block_address(sample.block_offset),
            data: sample
                .payload
                .iter()
                .map(|b| b.to_string())
                .collect::<Vec<_>>()
                .join(","),
            created_at: sample.captured_at,
        };
        self.write_row(&row)?;
        self.samples.push(sample.clone());
        Ok(())
    }

    fn append_sensor(&mut self, sensor: &SensorRecord) -> Result<()> {
        let row = SensorRow {
            table: "sensor".to_string(),
            uid: sensor.uid.clone(),
            board_kind: sensor.board_kind.clone(),
            temperature_raw: sensor.temperature_raw,
            voltage_raw: sensor.voltage_raw,
            temp30_cal: sensor.temp30_cal,
            temp110_cal: sensor.temp110_cal,
            vdd_cal: sensor.vdd_cal,
            created_at: sensor.captured_at,
        };
        self.write_row(&row)
    }

    fn reference_dump(&self, uid: &str, blocks: u32) -> Result<Vec<SampleRecord>> {
        Ok(earliest_per_offset(&self.samples, uid, blocks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(uid: &str, offset: u32, fill: u8, at: DateTime<Utc>) -> SampleRecord {
        SampleRecord {
            uid: uid.to_string(),
            board_kind: "nucleo".to_string(),
            pic: 1,
            block_offset: offset,
            payload: vec![fill; DATA_SIZE],
            captured_at: at,
        }
    }

    #[test]
    fn test_reference_dump_picks_earliest() {
        let mut store = MemoryStore::new();
        let early = Utc::now();
        let late = early + chrono::Duration::hours(1);
        store.append_sample(&sample("A", 0, 0x11, late)).unwrap();
        store.append_sample(&sample("A", 0, 0x22, early)).unwrap();
        store.append_sample(&sample("A", 1, 0x33, late)).unwrap();

        let reference = store.reference_dump("A", 2).unwrap();
        assert_eq!(reference.len(), 2);
        assert_eq!(reference[0].payload[0], 0x22);
        assert_eq!(reference[1].payload[0], 0x33);
    }

    #[test]
    fn test_reference_dump_partial_and_missing() {
        let mut store = MemoryStore::new();
        assert!(store.reference_dump("A", 4).unwrap().is_empty());

        store
            .append_sample(&sample("A", 0, 0x11, Utc::now()))
            .unwrap();
        let reference = store.reference_dump("A", 4).unwrap();
        assert_eq!(reference.len(), 1);
    }

    #[test]
    fn test_sensor_conversions() {
        let record = SensorRecord {
            uid: "A".to_string(),
            board_kind: "nucleo".to_string(),
            temperature_raw: 900,
            voltage_raw: 1650,
            temp30_cal: 800,
            temp110_cal: 1200,
            vdd_cal: 1500,
            captured_at: Utc::now(),
        };
        let temp = record.temperature_celsius().unwrap();
        assert!((temp - 50.0).abs() < 1e-9);
        let vdd = record.vdd_volts().unwrap();
        assert!((vdd - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_sensor_conversion_without_calibration() {
        let record = SensorRecord {
            uid: "A".to_string(),
            board_kind: "nucleo".to_string(),
            temperature_raw: 900,
            voltage_raw: 0,
            temp30_cal: 0,
            temp110_cal: 0,
            vdd_cal: 0,
            captured_at: Utc::now(),
        };
        assert!(record.temperature_celsius().is_none());
        assert!(record.vdd_volts().is_none());
    }

    #[test]
    fn test_jsonl_store_roundtrip() {
        let dir = std::env::temp_dir().join("sramlink-store-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("samples-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let mut store = JsonlStore::open(&path).unwrap();
            store
                .append_sample(&sample("A", 2, 0x5A, Utc::now()))
                .unwrap();
        }

        let store = JsonlStore::open(&path).unwrap();
        let reference = store.reference_dump("A", 3).unwrap();
        assert_eq!(reference.len(), 1);
        assert_eq!(reference[0].block_offset, 2);
        assert_eq!(reference[0].payload, vec![0x5A; DATA_SIZE]);

        std::fs::remove_file(&path).unwrap();
    }
}
