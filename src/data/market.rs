/// Market OHLCV series: loading, truncation for the guarded replay, and
/// serialization into a sandbox scratch directory.
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{HarnessError, Result};

/// One OHLCV bar. The datetime stays an ISO-8601 string: bar ordering is
/// lexicographic and byte-stable across runs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Bar {
    pub datetime: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Read-only market data input for one strategy run.
#[derive(Clone, Debug)]
pub struct MarketData {
    symbol: String,
    bars: Vec<Bar>,
}

impl MarketData {
    pub fn new(symbol: &str, bars: Vec<Bar>) -> Result<Self> {
        for pair in bars.windows(2) {
            if pair[1].datetime <= pair[0].datetime {
                return Err(HarnessError::Data(format!(
                    "bars not strictly increasing at {}",
                    pair[1].datetime
                )));
            }
        }
        Ok(Self {
            symbol: symbol.to_string(),
            bars,
        })
    }

    pub fn from_csv_path(symbol: &str, path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            HarnessError::Data(format!("cannot open market data {}: {}", path.display(), e))
        })?;
        Self::from_csv_reader(symbol, file)
    }

    pub fn from_csv_reader<R: Read>(symbol: &str, reader: R) -> Result<Self> {
        let mut rdr = csv::Reader::from_reader(reader);
        let mut bars = Vec::new();
        for record in rdr.deserialize() {
            let bar: Bar =
                record.map_err(|e| HarnessError::Data(format!("bad market data row: {}", e)))?;
            bars.push(bar);
        }
        Self::new(symbol, bars)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    /// Prefix of the series up to and including bar `len - 1`. Used by the
    /// Anti-Leak gate's guarded replay.
    pub fn truncate(&self, len: usize) -> Self {
        Self {
            symbol: self.symbol.clone(),
            bars: self.bars[..len.min(self.bars.len())].to_vec(),
        }
    }

    /// Write the series as CSV into a sandbox scratch directory.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        let mut wtr = csv::Writer::from_writer(Vec::new());
        for bar in &self.bars {
            wtr.serialize(bar)
                .map_err(|e| HarnessError::Data(format!("cannot serialize bar: {}", e)))?;
        }
        let body = wtr
            .into_inner()
            .map_err(|e| HarnessError::Data(format!("csv writer error: {}", e)))?;
        file.write_all(&body)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Synthetic series with a deterministic wobble around 100.
    pub fn synthetic_series(n: usize) -> MarketData {
        let bars = (0..n)
            .map(|i| {
                let close = 100.0 + ((i % 7) as f64) - 3.0 + (i as f64) * 0.01;
                Bar {
                    datetime: format!("2024-01-01T00:{:02}:00", i),
                    open: close - 0.5,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 1_000.0 + i as f64,
                }
            })
            .collect();
        MarketData::new("TEST", bars).unwrap()
    }
}
