use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};

use super::execution::EventFeed;
use crate::gridtrade::types::{EngineEvent, Quote};

/// Quote stream recorded as JSONL, one `{timestamp, instrument, bid, ask}` per line.
#[derive(Debug)]
pub struct ReplayFeed {
    quotes: VecDeque<Quote>,
}

impl ReplayFeed {
    pub fn new(path: &str) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open replay file {}", path))?;
        Self::from_reader(file).with_context(|| format!("failed to load replay file {}", path))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut quotes = VecDeque::new();
        for (index, line) in BufReader::new(reader).lines().enumerate() {
            let line = line.context("failed to read replay line")?;
            if line.trim().is_empty() {
                continue;
            }
            let quote: Quote = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse replay line {}: '{}'", index + 1, line))?;
            quotes.push_back(quote);
        }
        if quotes.is_empty() {
            return Err(anyhow!("replay data is empty"));
        }
        log::info!("[REPLAY] loaded {} quotes", quotes.len());
        Ok(Self { quotes })
    }

    pub fn remaining(&self) -> usize {
        self.quotes.len()
    }
}

#[async_trait]
impl EventFeed for ReplayFeed {
    async fn next_event(&mut self) -> Result<Option<(i64, EngineEvent)>> {
        Ok(self
            .quotes
            .pop_front()
            .map(|quote| (quote.timestamp, EngineEvent::QuoteUpdate(quote))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn replays_quotes_in_file_order() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"timestamp":1000,"instrument":"AAA","bid":99.0,"ask":101.0}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"timestamp":1500,"instrument":"BBB","bid":49.0,"ask":51.0}}"#
        )
        .unwrap();

        let mut feed = ReplayFeed::new(file.path().to_str().unwrap()).unwrap();
        assert_eq!(feed.remaining(), 2);

        let (ts, event) = feed.next_event().await.unwrap().unwrap();
        assert_eq!(ts, 1000);
        assert!(matches!(event, EngineEvent::QuoteUpdate(q) if q.instrument.as_str() == "AAA"));
        let (ts, _) = feed.next_event().await.unwrap().unwrap();
        assert_eq!(ts, 1500);
        assert!(feed.next_event().await.unwrap().is_none());
    }

    #[test]
    fn rejects_malformed_lines() {
        let data = "{\"timestamp\":1,\"instrument\":\"AAA\",\"bid\":1.0}\n";
        let err = ReplayFeed::from_reader(data.as_bytes()).unwrap_err();
        assert!(format!("{:#}", err).contains("line 1"));
    }

    #[test]
    fn rejects_empty_data() {
        assert!(ReplayFeed::from_reader("\n\n".as_bytes()).is_err());
    }
}
