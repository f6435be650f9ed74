use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::collection::CollectionName;
use crate::rate_limit::OperationClass;

/// These are the request "commands" that can be made to a prediction store server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// read a whole collection
    Get {
        /// the collection to read
        collection: CollectionName,
    },
    /// shallow-merge a JSON object into a collection
    Put {
        /// the collection to update
        collection: CollectionName,
        /// the partial update, must be a JSON object
        delta: Value,
    },
    /// queue a snapshot
    Backup,
    /// queue a CSV export
    Export,
    /// snapshot, then empty every collection
    ClearAll,
    /// snapshot, then empty guesses and results
    Restart,
    /// aggregate counters
    Stats,
    /// the winners join
    Winners,
    /// list snapshot identifiers, newest first
    Snapshots,
    /// replace every collection with a snapshot
    Restore {
        /// the snapshot identifier
        snapshot: String,
    },
    /// a health report, never rate limited
    Health,
}

impl Request {
    /// the class whose quota this request counts against, `None` if it isn't rate limited
    pub fn operation_class(&self) -> Option<OperationClass> {
        let class = match self {
            Request::Get { collection } => OperationClass::read_of(*collection),
            Request::Put { collection, .. } => OperationClass::write_of(*collection),
            Request::Backup => OperationClass::Backup,
            Request::Export => OperationClass::Export,
            Request::ClearAll => OperationClass::ClearAll,
            Request::Restore { .. } => OperationClass::Restore,
            Request::Restart => OperationClass::Restart,
            Request::Stats => OperationClass::Stats,
            Request::Winners | Request::Snapshots => OperationClass::Read,
            Request::Health => return None,
        };
        Some(class)
    }
}

/// The response Types that can be returned for any Request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// this variant is returned when a request was successful
    Ok(Value),
    /// this variant is returned if an Error occurs while processing the request
    Err(String),
    /// the request was refused by the rate limiter and may be retried later
    RateLimited(String),
}
