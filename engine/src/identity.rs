//! Record identity and content hashing.
//!
//! Identifiers are UUID v7 strings: globally unique and ordered by creation
//! time, so a plain string sort of local ids follows creation order. Content
//! hashes are SHA-256 over a canonical encoding of the business fields.

use crate::record::{ActivityFields, ActivityType};
use crate::{RecordId, Timestamp};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

static GENERATOR: Mutex<IdGenerator> = Mutex::new(IdGenerator::new());

/// Create a new sortable unique identifier.
///
/// Calls within one process never collide and each id sorts strictly after
/// the previous one, even when the system clock stalls or steps backwards.
pub fn create_identifier() -> RecordId {
    GENERATOR
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .next_id()
}

/// Monotonic UUID v7 generator.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Option<Uuid>,
}

impl IdGenerator {
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Produce the next identifier.
    pub fn next_id(&mut self) -> RecordId {
        let mut id = Uuid::now_v7();
        if let Some(last) = self.last {
            if id <= last {
                // Same millisecond with an unlucky random tail, or a clock
                // step backwards: continue from the last id instead.
                id = Uuid::from_u128(last.as_u128().wrapping_add(1));
            }
        }
        self.last = Some(id);
        id.to_string()
    }
}

/// Canonical field order for hashing. Every field is always present so that
/// `None` and a missing key can never hash differently.
#[derive(Serialize)]
struct HashInput<'a> {
    baby_id: &'a str,
    activity_type: ActivityType,
    subtype: Option<&'a str>,
    start_time: Timestamp,
    end_time: Option<Timestamp>,
    amount: Option<f64>,
    unit: Option<&'a str>,
    category: Option<&'a str>,
    details: Option<&'a str>,
}

/// Compute the content digest of an activity's business fields.
///
/// Equal fields always give equal hashes; any differing field gives a
/// different hash with overwhelming probability.
pub fn compute_content_hash(fields: &ActivityFields) -> String {
    let input = HashInput {
        baby_id: &fields.baby_id,
        activity_type: fields.activity_type,
        subtype: fields.subtype.as_deref(),
        start_time: fields.start_time,
        end_time: fields.end_time,
        // -0.0 compares equal to 0.0 but serializes differently.
        amount: fields.amount.map(|a| if a == 0.0 { 0.0 } else { a }),
        unit: fields.unit.as_deref(),
        category: fields.category.as_deref(),
        details: fields.details.as_deref(),
    };

    // Serializing plain strings, integers and finite floats cannot fail;
    // non-finite floats (rejected by validation anyway) encode as null.
    let encoded = serde_json::to_vec(&input).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}
