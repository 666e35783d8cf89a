//! Commit log record framing.
//!
//! ```text
//! 0   totalSize(4)  magic(4)  bodyCrc(4)  queueId(4)  flag(4)
//! 20  queueOffset(8)  physicalOffset(8)  sysFlag(4)
//! 40  bornTimestamp(8)  bornHost(8)  storeTimestamp(8)  storeHost(8)
//! 72  reconsumeTimes(4)  preparedTransactionOffset(8)
//! 84  bodyLength(4) body  topicLength(1) topic  propertiesLength(2) properties
//! ```
//!
//! All integers are big-endian. A segment tail that cannot fit the next record
//! is padded with a blank marker: `totalSize(remaining) + BLANK_MAGIC`.

use crate::store::config::hash_code;
use bytes::{Buf, BufMut, Bytes};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

pub const MESSAGE_MAGIC: u32 = 0xDAA3_20A7;
pub const BLANK_MAGIC: u32 = 0xCBD4_3194;

/// Every segment keeps this many bytes spare for the blank marker.
pub const END_OF_SEGMENT_MIN_BLANK: usize = 8;

pub(crate) const QUEUE_OFFSET_POS: usize = 20;
pub(crate) const PHYSICAL_OFFSET_POS: usize = 28;
pub(crate) const STORE_TIMESTAMP_POS: usize = 56;
const BODY_LENGTH_POS: usize = 84;
const FIXED_LEN: usize = BODY_LENGTH_POS + 4 + 1 + 2;

pub const MAX_TOPIC_LEN: usize = 127;
pub const MAX_PROPERTIES_LEN: usize = i16::MAX as usize;

const NAME_VALUE_SEPARATOR: char = '\u{1}';
const PROPERTY_SEPARATOR: char = '\u{2}';

pub mod sys_flag {
    pub const COMPRESSED: i32 = 0x1;
    pub const MULTI_TAGS: i32 = 0x2;
    pub const TRANSACTION_NOT_TYPE: i32 = 0;
    pub const TRANSACTION_PREPARED_TYPE: i32 = 0x1 << 2;
    pub const TRANSACTION_COMMIT_TYPE: i32 = 0x2 << 2;
    pub const TRANSACTION_ROLLBACK_TYPE: i32 = 0x3 << 2;
    pub(crate) const TRANSACTION_MASK: i32 = 0x3 << 2;
}

/// Well-known property names.
pub mod property {
    pub const PRODUCER_GROUP: &str = "PGROUP";
    pub const TAGS: &str = "TAGS";
    pub const KEYS: &str = "KEYS";
    pub const UNIQ_KEY: &str = "UNIQ_KEY";
    pub const WAIT_STORE_OK: &str = "WAIT";
    pub const TRAN_STATE_OFFSET: &str = "TRAN_STATE_OFFSET";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Normal,
    Prepared,
    Commit,
    Rollback,
}

impl TransactionState {
    pub fn from_sys_flag(flag: i32) -> Self {
        match flag & sys_flag::TRANSACTION_MASK {
            sys_flag::TRANSACTION_PREPARED_TYPE => Self::Prepared,
            sys_flag::TRANSACTION_COMMIT_TYPE => Self::Commit,
            sys_flag::TRANSACTION_ROLLBACK_TYPE => Self::Rollback,
            _ => Self::Normal,
        }
    }

    pub fn sys_flag_bits(self) -> i32 {
        match self {
            Self::Normal => sys_flag::TRANSACTION_NOT_TYPE,
            Self::Prepared => sys_flag::TRANSACTION_PREPARED_TYPE,
            Self::Commit => sys_flag::TRANSACTION_COMMIT_TYPE,
            Self::Rollback => sys_flag::TRANSACTION_ROLLBACK_TYPE,
        }
    }

    /// Value persisted in the transaction state table.
    pub(crate) fn as_i32(self) -> i32 {
        self.sys_flag_bits()
    }

    pub(crate) fn from_i32(v: i32) -> Self {
        Self::from_sys_flag(v)
    }

    /// Normal and committed records are visible to consumers.
    pub fn is_consumable(self) -> bool {
        matches!(self, Self::Normal | Self::Commit)
    }
}

fn default_host() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)
}

/// A record as handed to the store by a producer.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub queue_id: i32,
    pub flag: i32,
    pub body: Bytes,
    pub properties: BTreeMap<String, String>,
    pub sys_flag: i32,
    pub born_timestamp: u64,
    pub born_host: SocketAddrV4,
    pub store_host: SocketAddrV4,
    pub reconsume_times: i32,
    pub prepared_transaction_offset: i64,
    /// Only honoured for rollback records; every other kind gets an offset assigned.
    pub queue_offset: i64,
}

impl Message {
    pub fn new(topic: impl Into<String>, queue_id: i32, body: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            queue_id,
            flag: 0,
            body: body.into(),
            properties: BTreeMap::new(),
            sys_flag: 0,
            born_timestamp: crate::store::config::now_millis(),
            born_host: default_host(),
            store_host: default_host(),
            reconsume_times: 0,
            prepared_transaction_offset: 0,
            queue_offset: 0,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_tags(self, tags: impl Into<String>) -> Self {
        self.with_property(property::TAGS, tags)
    }

    pub fn with_keys(self, keys: impl Into<String>) -> Self {
        self.with_property(property::KEYS, keys)
    }

    pub fn with_producer_group(self, group: impl Into<String>) -> Self {
        self.with_property(property::PRODUCER_GROUP, group)
    }

    pub fn with_transaction_state(mut self, state: TransactionState) -> Self {
        self.sys_flag = (self.sys_flag & !sys_flag::TRANSACTION_MASK) | state.sys_flag_bits();
        self
    }

    pub fn with_wait_store_ok(self, wait: bool) -> Self {
        self.with_property(property::WAIT_STORE_OK, if wait { "true" } else { "false" })
    }

    pub fn transaction_state(&self) -> TransactionState {
        TransactionState::from_sys_flag(self.sys_flag)
    }

    pub fn tags(&self) -> Option<&str> {
        self.properties.get(property::TAGS).map(String::as_str)
    }

    pub fn wait_store_ok(&self) -> bool {
        self.properties
            .get(property::WAIT_STORE_OK)
            .map_or(true, |v| v != "false")
    }
}

/// A record decoded back from the commit log.
#[derive(Debug, Clone)]
pub struct CommitLogRecord {
    pub total_size: i32,
    pub body_crc: u32,
    pub queue_id: i32,
    pub flag: i32,
    pub queue_offset: i64,
    pub physical_offset: u64,
    pub sys_flag: i32,
    pub born_timestamp: u64,
    pub born_host: SocketAddrV4,
    pub store_timestamp: u64,
    pub store_host: SocketAddrV4,
    pub reconsume_times: i32,
    pub prepared_transaction_offset: i64,
    pub body: Bytes,
    pub topic: String,
    pub properties: BTreeMap<String, String>,
}

impl CommitLogRecord {
    pub fn transaction_state(&self) -> TransactionState {
        TransactionState::from_sys_flag(self.sys_flag)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// What the dispatcher needs from one record: where it lives, where it is
/// indexed and its transaction side fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub topic: String,
    pub queue_id: i32,
    pub commit_log_offset: u64,
    pub size: i32,
    pub tags_code: i64,
    pub store_timestamp: u64,
    pub queue_offset: i64,
    pub keys: Option<String>,
    pub uniq_key: Option<String>,
    pub sys_flag: i32,
    pub prepared_transaction_offset: i64,
    pub producer_group: Option<String>,
    /// State-table slot a commit or rollback resolves.
    pub state_table_offset: i64,
}

impl DispatchRequest {
    pub fn transaction_state(&self) -> TransactionState {
        TransactionState::from_sys_flag(self.sys_flag)
    }

    pub fn producer_group_hash(&self) -> i32 {
        self.producer_group.as_deref().map_or(0, hash_code)
    }
}

/// Result of decoding at one position of the commit log.
#[derive(Debug, Clone)]
pub enum DecodeOutcome<T> {
    Record(T),
    /// Blank marker: the rest of the segment is padding.
    EndOfSegment,
    /// Valid header, but the record runs past the end of the buffer.
    Incomplete { declared_size: i32 },
    /// Not a valid record. A positive size is the length the header claimed.
    Corrupt { declared_size: i32 },
}

pub fn tags_code(tags: Option<&str>) -> i64 {
    tags.filter(|t| !t.is_empty()).map_or(0, |t| hash_code(t) as i64)
}

pub fn body_crc(body: &[u8]) -> u32 {
    crc32fast::hash(body) & 0x7FFF_FFFF
}

pub fn encode_properties(properties: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in properties {
        out.push_str(k);
        out.push(NAME_VALUE_SEPARATOR);
        out.push_str(v);
        out.push(PROPERTY_SEPARATOR);
    }
    out
}

pub fn decode_properties(raw: &str) -> BTreeMap<String, String> {
    raw.split(PROPERTY_SEPARATOR)
        .filter_map(|pair| {
            let (k, v) = pair.split_once(NAME_VALUE_SEPARATOR)?;
            Some((k.to_string(), v.to_string()))
        })
        .collect()
}

pub(crate) fn encoded_len(body_len: usize, topic_len: usize, properties_len: usize) -> usize {
    FIXED_LEN + body_len + topic_len + properties_len
}

/// Offsets and clock assigned under the write lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Placement {
    pub physical_offset: u64,
    pub queue_offset: i64,
    pub store_timestamp: u64,
}

fn put_host(out: &mut &mut [u8], host: &SocketAddrV4) {
    out.put_slice(&host.ip().octets());
    out.put_u32(host.port() as u32);
}

/// Serialize `msg` into the front of `out`, which must hold `encoded_len` bytes.
pub(crate) fn encode_into(out: &mut [u8], msg: &Message, properties: &[u8], at: Placement) -> usize {
    let total = encoded_len(msg.body.len(), msg.topic.len(), properties.len());
    let mut buf = &mut out[..total];
    buf.put_u32(total as u32);
    buf.put_u32(MESSAGE_MAGIC);
    buf.put_u32(body_crc(&msg.body));
    buf.put_i32(msg.queue_id);
    buf.put_i32(msg.flag);
    buf.put_i64(at.queue_offset);
    buf.put_u64(at.physical_offset);
    buf.put_i32(msg.sys_flag);
    buf.put_u64(msg.born_timestamp);
    put_host(&mut buf, &msg.born_host);
    buf.put_u64(at.store_timestamp);
    put_host(&mut buf, &msg.store_host);
    buf.put_i32(msg.reconsume_times);
    buf.put_i64(msg.prepared_transaction_offset);
    buf.put_u32(msg.body.len() as u32);
    buf.put_slice(&msg.body);
    buf.put_u8(msg.topic.len() as u8);
    buf.put_slice(msg.topic.as_bytes());
    buf.put_u16(properties.len() as u16);
    buf.put_slice(properties);
    total
}

/// Pad the whole of `out` with a blank marker. Returns the padded length.
pub(crate) fn write_blank(out: &mut [u8]) -> usize {
    let len = out.len();
    if len >= END_OF_SEGMENT_MIN_BLANK {
        let mut buf = &mut out[..END_OF_SEGMENT_MIN_BLANK];
        buf.put_u32(len as u32);
        buf.put_u32(BLANK_MAGIC);
    }
    len
}

pub(crate) fn read_store_timestamp(buf: &[u8]) -> Option<u64> {
    let mut field = buf.get(STORE_TIMESTAMP_POS..STORE_TIMESTAMP_POS + 8)?;
    Some(field.get_u64())
}

fn get_host(buf: &mut &[u8]) -> SocketAddrV4 {
    let mut octets = [0u8; 4];
    buf.copy_to_slice(&mut octets);
    let port = buf.get_u32();
    SocketAddrV4::new(Ipv4Addr::from(octets), port as u16)
}

/// Decode the record at the start of `buf`. `read_body` controls whether the
/// body is copied out; the crc is checked against the in-place bytes either way.
pub fn decode_record(buf: &[u8], check_crc: bool, read_body: bool) -> DecodeOutcome<CommitLogRecord> {
    if buf.len() < END_OF_SEGMENT_MIN_BLANK {
        return DecodeOutcome::Corrupt { declared_size: -1 };
    }
    let mut cur = buf;
    let total_size = cur.get_i32();
    let magic = cur.get_u32();
    match magic {
        BLANK_MAGIC => return DecodeOutcome::EndOfSegment,
        MESSAGE_MAGIC => {}
        _ => {
            return DecodeOutcome::Corrupt {
                declared_size: total_size,
            }
        }
    }
    let corrupt = DecodeOutcome::Corrupt {
        declared_size: total_size,
    };
    if total_size < FIXED_LEN as i32 {
        return corrupt;
    }
    if buf.len() < total_size as usize {
        return DecodeOutcome::Incomplete {
            declared_size: total_size,
        };
    }
    let mut cur = &buf[8..total_size as usize];

    let crc = cur.get_u32();
    let queue_id = cur.get_i32();
    let flag = cur.get_i32();
    let queue_offset = cur.get_i64();
    let physical_offset = cur.get_u64();
    let sys_flag = cur.get_i32();
    let born_timestamp = cur.get_u64();
    let born_host = get_host(&mut cur);
    let store_timestamp = cur.get_u64();
    let store_host = get_host(&mut cur);
    let reconsume_times = cur.get_i32();
    let prepared_transaction_offset = cur.get_i64();

    let body_len = cur.get_u32() as usize;
    if cur.remaining() < body_len + 1 {
        return corrupt;
    }
    let body_slice = &cur[..body_len];
    if check_crc && body_crc(body_slice) != crc {
        return corrupt;
    }
    let body = if read_body {
        Bytes::copy_from_slice(body_slice)
    } else {
        Bytes::new()
    };
    cur.advance(body_len);

    let topic_len = cur.get_u8() as usize;
    if cur.remaining() < topic_len + 2 {
        return corrupt;
    }
    let topic = match std::str::from_utf8(&cur[..topic_len]) {
        Ok(t) => t.to_string(),
        Err(_) => return corrupt,
    };
    cur.advance(topic_len);

    let properties_len = cur.get_u16() as usize;
    if cur.remaining() != properties_len {
        return corrupt;
    }
    let properties = match std::str::from_utf8(cur) {
        Ok(raw) => decode_properties(raw),
        Err(_) => return corrupt,
    };

    DecodeOutcome::Record(CommitLogRecord {
        total_size,
        body_crc: crc,
        queue_id,
        flag,
        queue_offset,
        physical_offset,
        sys_flag,
        born_timestamp,
        born_host,
        store_timestamp,
        store_host,
        reconsume_times,
        prepared_transaction_offset,
        body,
        topic,
        properties,
    })
}

/// Decode just what the dispatcher needs from the record at the start of `buf`.
pub fn decode_dispatch(buf: &[u8], check_crc: bool) -> DecodeOutcome<DispatchRequest> {
    match decode_record(buf, check_crc, false) {
        DecodeOutcome::Record(rec) => DecodeOutcome::Record(rec.into()),
        DecodeOutcome::EndOfSegment => DecodeOutcome::EndOfSegment,
        DecodeOutcome::Incomplete { declared_size } => DecodeOutcome::Incomplete { declared_size },
        DecodeOutcome::Corrupt { declared_size } => DecodeOutcome::Corrupt { declared_size },
    }
}

impl From<CommitLogRecord> for DispatchRequest {
    fn from(mut rec: CommitLogRecord) -> Self {
        let tags_code = tags_code(rec.property(property::TAGS));
        let state_table_offset = rec
            .property(property::TRAN_STATE_OFFSET)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(rec.queue_offset);
        Self {
            commit_log_offset: rec.physical_offset,
            size: rec.total_size,
            tags_code,
            store_timestamp: rec.store_timestamp,
            queue_offset: rec.queue_offset,
            keys: rec.properties.remove(property::KEYS),
            uniq_key: rec.properties.remove(property::UNIQ_KEY),
            sys_flag: rec.sys_flag,
            prepared_transaction_offset: rec.prepared_transaction_offset,
            producer_group: rec.properties.remove(property::PRODUCER_GROUP),
            state_table_offset,
            queue_id: rec.queue_id,
            topic: rec.topic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(msg: &Message, at: Placement) -> Vec<u8> {
        let props = encode_properties(&msg.properties);
        let mut out = vec![0u8; encoded_len(msg.body.len(), msg.topic.len(), props.len())];
        let n = encode_into(&mut out, msg, props.as_bytes(), at);
        assert_eq!(n, out.len());
        out
    }

    fn placement() -> Placement {
        Placement {
            physical_offset: 4096,
            queue_offset: 7,
            store_timestamp: 1_700_000_000_123,
        }
    }

    #[test]
    fn header_fields_sit_at_fixed_positions() {
        let msg = Message::new("TopicA", 3, &b"payload"[..]).with_tags("TagA");
        let bytes = encode(&msg, placement());

        assert_eq!(&bytes[4..8], &MESSAGE_MAGIC.to_be_bytes());
        assert_eq!(&bytes[QUEUE_OFFSET_POS..QUEUE_OFFSET_POS + 8], &7i64.to_be_bytes());
        assert_eq!(
            &bytes[PHYSICAL_OFFSET_POS..PHYSICAL_OFFSET_POS + 8],
            &4096u64.to_be_bytes()
        );
        assert_eq!(read_store_timestamp(&bytes), Some(1_700_000_000_123));
    }

    #[test]
    fn decode_recovers_fields_and_properties() {
        let msg = Message::new("TopicA", 3, &b"payload"[..])
            .with_tags("TagA")
            .with_keys("k1 k2")
            .with_producer_group("PG")
            .with_transaction_state(TransactionState::Commit);
        let bytes = encode(&msg, placement());

        let rec = match decode_record(&bytes, true, true) {
            DecodeOutcome::Record(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(rec.topic, "TopicA");
        assert_eq!(rec.queue_id, 3);
        assert_eq!(&rec.body[..], b"payload");
        assert_eq!(rec.total_size as usize, bytes.len());
        assert_eq!(rec.transaction_state(), TransactionState::Commit);
        assert_eq!(rec.property(property::TAGS), Some("TagA"));

        let req = DispatchRequest::from(rec);
        assert_eq!(req.tags_code, hash_code("TagA") as i64);
        assert_eq!(req.keys.as_deref(), Some("k1 k2"));
        assert_eq!(req.producer_group_hash(), hash_code("PG"));
        assert_eq!(req.state_table_offset, 7, "falls back to the queue offset");
    }

    #[test]
    fn flipped_body_byte_fails_crc() {
        let msg = Message::new("T", 0, &b"abcdef"[..]);
        let mut bytes = encode(&msg, placement());
        bytes[FIXED_LEN - 3] ^= 0xFF;
        match decode_record(&bytes, true, false) {
            DecodeOutcome::Corrupt { declared_size } => {
                assert_eq!(declared_size as usize, bytes.len())
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            decode_record(&bytes, false, false),
            DecodeOutcome::Record(_)
        ));
    }

    #[test]
    fn blank_marker_and_garbage() {
        let mut tail = vec![0u8; 40];
        assert_eq!(write_blank(&mut tail), 40);
        assert!(matches!(
            decode_record(&tail, true, false),
            DecodeOutcome::EndOfSegment
        ));

        let zeros = vec![0u8; 40];
        assert!(matches!(
            decode_record(&zeros, true, false),
            DecodeOutcome::Corrupt { declared_size: 0 }
        ));
        assert!(matches!(
            decode_record(&zeros[..4], true, false),
            DecodeOutcome::Corrupt { declared_size: -1 }
        ));
    }

    #[test]
    fn truncated_record_is_incomplete_not_corrupt() {
        let bytes = encode(&Message::new("T", 0, &b"abcdef"[..]), placement());
        let half = bytes.len() / 2;
        match decode_record(&bytes[..half], true, false) {
            DecodeOutcome::Incomplete { declared_size } => {
                assert_eq!(declared_size as usize, bytes.len())
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            decode_dispatch(&bytes[..half], false),
            DecodeOutcome::Incomplete { .. }
        ));
    }

    #[test]
    fn unknown_magic_keeps_the_declared_size() {
        let mut bytes = encode(&Message::new("T", 0, &b"abcdef"[..]), placement());
        bytes[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        match decode_record(&bytes, true, false) {
            DecodeOutcome::Corrupt { declared_size } => {
                assert_eq!(declared_size as usize, bytes.len())
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn properties_codec() {
        let mut props = BTreeMap::new();
        props.insert("A".to_string(), "1".to_string());
        props.insert("B".to_string(), "two".to_string());
        let raw = encode_properties(&props);
        assert_eq!(raw, "A\u{1}1\u{2}B\u{1}two\u{2}");
        assert_eq!(decode_properties(&raw), props);
        assert!(decode_properties("").is_empty());
    }

    #[test]
    fn transaction_flags() {
        assert_eq!(TransactionState::Prepared.sys_flag_bits(), 4);
        assert_eq!(TransactionState::Commit.sys_flag_bits(), 8);
        assert_eq!(TransactionState::Rollback.sys_flag_bits(), 12);
        let flag = sys_flag::COMPRESSED | TransactionState::Rollback.sys_flag_bits();
        assert_eq!(TransactionState::from_sys_flag(flag), TransactionState::Rollback);
        assert!(TransactionState::Commit.is_consumable());
        assert!(!TransactionState::Prepared.is_consumable());
        assert_eq!(tags_code(None), 0);
        assert_eq!(tags_code(Some("")), 0);
    }
}
