use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};

use serde::Deserialize;
use serde_json::de::IoRead;
use serde_json::{Deserializer, Value};

use crate::collection::{Collection, CollectionName};
use crate::command::{Request, Response};
use crate::{Result, StoreError};

/// `PredictionClient` contains the functionality for communication with a
/// [`PredictionServer`](crate::PredictionServer)
pub struct PredictionClient {
    reader: Deserializer<IoRead<BufReader<TcpStream>>>,
    writer: BufWriter<TcpStream>,
}

impl PredictionClient {
    /// creates a client and establishes a socket connection to the server at the given `addr`
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let tcp_reader = TcpStream::connect(addr)?;
        let tcp_writer = tcp_reader.try_clone()?;

        Ok(PredictionClient {
            reader: Deserializer::from_reader(BufReader::new(tcp_reader)),
            writer: BufWriter::new(tcp_writer),
        })
    }

    /// Sends `req` and waits for its response.
    ///
    /// # Errors
    /// `Err<StoreError::StringErr>` if the server failed to process the request and
    /// `Err<StoreError::RateLimited>` if it refused the request because of its rate limit,
    /// which may be retried later
    pub fn send(&mut self, req: &Request) -> Result<Value> {
        serde_json::to_writer(&mut self.writer, req)?;
        self.writer.flush()?;

        match Response::deserialize(&mut self.reader)? {
            Response::Ok(value) => Ok(value),
            Response::Err(msg) => Err(StoreError::StringErr(msg)), // re-throwing error here
            Response::RateLimited(msg) => Err(StoreError::RateLimited(msg)),
        }
    }

    /// gets the whole `collection` from the server
    pub fn get(&mut self, collection: CollectionName) -> Result<Collection> {
        let value = self.send(&Request::Get { collection })?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(StoreError::StringErr(format!(
                "expected a JSON object, got {}",
                other
            ))),
        }
    }

    /// merges `delta` into `collection` on the server
    pub fn put(&mut self, collection: CollectionName, delta: Value) -> Result<Value> {
        self.send(&Request::Put { collection, delta })
    }

    /// asks the server to queue a snapshot
    pub fn backup(&mut self) -> Result<Value> {
        self.send(&Request::Backup)
    }

    /// asks the server to queue a CSV export
    pub fn export(&mut self) -> Result<Value> {
        self.send(&Request::Export)
    }

    /// snapshots, then clears every collection
    pub fn clear_all(&mut self) -> Result<Value> {
        self.send(&Request::ClearAll)
    }

    /// snapshots, then clears guesses and results
    pub fn restart(&mut self) -> Result<Value> {
        self.send(&Request::Restart)
    }

    /// aggregate counters
    pub fn stats(&mut self) -> Result<Value> {
        self.send(&Request::Stats)
    }

    /// the winners join
    pub fn winners(&mut self) -> Result<Value> {
        self.send(&Request::Winners)
    }

    /// snapshot identifiers, newest first
    pub fn snapshots(&mut self) -> Result<Value> {
        self.send(&Request::Snapshots)
    }

    /// restores every collection from `snapshot`, after snapshotting the current data
    pub fn restore(&mut self, snapshot: String) -> Result<Value> {
        self.send(&Request::Restore { snapshot })
    }

    /// the server's health report
    pub fn health(&mut self) -> Result<Value> {
        self.send(&Request::Health)
    }
}
