//! Event records crossing the sensor/consumer boundary.
//!
//! Every intercepted operation is reported as a fixed-shape [`EventRecord`]:
//! common attribution (subject identity, timestamp, process credentials)
//! plus a kind-specific payload. Records are serializable so the consumer
//! side can forward them over the feed without re-deriving anything.
//!
//! String fields carry hard byte bounds inherited from the wire layout:
//! oversized paths and domains are truncated at a character boundary, never
//! rejected.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Maximum byte length of a path or DNS result field.
pub const MAX_PATH_LEN: usize = 1024;

/// Maximum byte length of a DNS domain name field.
pub const MAX_NAME_LEN: usize = 256;

/// Event kinds observed by the sensor.
///
/// Authorization-class kinds occupy the `0x1xx` range and expect a verdict;
/// notify-class kinds occupy `0x2xx` and are fire-and-forget telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Process execution awaiting an authorization verdict.
    AuthExec = 0x101,

    /// Process execution, notify only.
    NotifyExec = 0x201,
    /// Regular file closed after modification.
    NotifyFileModify = 0x202,
    /// Regular file renamed.
    NotifyFileRename = 0x203,
    /// Regular file deleted.
    NotifyFileDelete = 0x204,
    /// Outbound network connection observed.
    NotifyNetConnect = 0x205,
    /// DNS resolution observed.
    NotifyDnsResolve = 0x206,
}

impl EventKind {
    /// Whether this kind blocks the intercepted operation pending a verdict.
    pub fn is_auth(self) -> bool {
        (self as u32) & 0x100 != 0 && (self as u32) < 0x200
    }

    /// Whether this kind is best-effort telemetry.
    pub fn is_notify(self) -> bool {
        (self as u32) >= 0x200
    }
}

/// Credentials and lineage of the process behind an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub ppid: i32,
    pub ruid: u32,
    pub euid: u32,
    pub rgid: u32,
    pub egid: u32,
}

impl ProcessInfo {
    /// Packs the pid/ppid pair into the single cache word used by the
    /// attribution caches.
    pub fn packed_lineage(&self) -> u64 {
        (u64::from(self.pid as u32) << 32) | u64::from(self.ppid as u32)
    }

    /// Unpacks a cache word back into a pid/ppid pair.
    pub fn unpack_lineage(packed: u64) -> (i32, i32) {
        ((packed >> 32) as u32 as i32, packed as u32 as i32)
    }
}

/// File metadata reported alongside file-class events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub path: String,
}

impl FileInfo {
    /// Creates file metadata with the path truncated to the wire bound.
    pub fn new(uid: u32, gid: u32, mode: u16, path: &str) -> Self {
        Self {
            uid,
            gid,
            mode,
            atime: 0,
            mtime: 0,
            ctime: 0,
            path: truncate_to_bytes(path, MAX_PATH_LEN),
        }
    }

    /// Sets the access/modify/change timestamps (seconds).
    pub fn with_times(mut self, atime: u64, mtime: u64, ctime: u64) -> Self {
        self.atime = atime;
        self.mtime = mtime;
        self.ctime = ctime;
        self
    }
}

/// Endpoint addresses of an observed connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Transport protocol number (6 = TCP, 17 = UDP).
    pub protocol: u16,
    pub local_addr: String,
    pub local_port: u16,
    pub remote_addr: String,
    pub remote_port: u16,
}

/// A DNS question and its observed answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsInfo {
    /// Resolver status code; zero is success.
    pub status: i32,
    pub domain: String,
    pub result: String,
}

impl DnsInfo {
    /// Creates a DNS payload with domain and result truncated to their wire
    /// bounds.
    pub fn new(status: i32, domain: &str, result: &str) -> Self {
        Self {
            status,
            domain: truncate_to_bytes(domain, MAX_NAME_LEN),
            result: truncate_to_bytes(result, MAX_PATH_LEN),
        }
    }
}

/// Kind-specific payload of an event record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPayload {
    /// Execution, modification, and deletion events carry file metadata.
    File(FileInfo),
    /// Rename events carry the source metadata and the destination path.
    Rename { source: FileInfo, new_path: String },
    /// Connection events.
    Network(NetworkInfo),
    /// DNS resolution events.
    Dns(DnsInfo),
}

/// One observed operation, as delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Identity of the subject object (file identity, port, or address).
    pub identity: u64,
    /// Event time, seconds since the epoch.
    pub event_time: u64,
    pub kind: EventKind,
    pub process: ProcessInfo,
    pub payload: EventPayload,
}

impl EventRecord {
    /// Builds a record stamped with the current wall-clock second.
    pub fn new(kind: EventKind, identity: u64, process: ProcessInfo, payload: EventPayload) -> Self {
        let payload = match payload {
            EventPayload::Rename { source, new_path } => EventPayload::Rename {
                source,
                new_path: truncate_to_bytes(&new_path, MAX_PATH_LEN),
            },
            other => other,
        };
        Self {
            identity,
            event_time: unix_seconds(),
            kind,
            process,
            payload,
        }
    }
}

/// Current wall-clock time in whole seconds since the epoch.
pub(crate) fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Truncates `s` to at most `max` bytes without splitting a character.
fn truncate_to_bytes(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_ranges_are_disjoint() {
        assert!(EventKind::AuthExec.is_auth());
        assert!(!EventKind::AuthExec.is_notify());
        for kind in [
            EventKind::NotifyExec,
            EventKind::NotifyFileModify,
            EventKind::NotifyFileRename,
            EventKind::NotifyFileDelete,
            EventKind::NotifyNetConnect,
            EventKind::NotifyDnsResolve,
        ] {
            assert!(kind.is_notify());
            assert!(!kind.is_auth());
        }
    }

    #[test]
    fn test_oversized_path_is_truncated_not_rejected() {
        let long = "x".repeat(MAX_PATH_LEN + 100);
        let info = FileInfo::new(0, 0, 0o644, &long);
        assert_eq!(info.path.len(), MAX_PATH_LEN);

        let dns = DnsInfo::new(0, &"d".repeat(MAX_NAME_LEN * 2), "1.2.3.4");
        assert_eq!(dns.domain.len(), MAX_NAME_LEN);
        assert_eq!(dns.result, "1.2.3.4");
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        // A multi-byte character straddling the limit is dropped whole.
        let s = format!("{}é", "a".repeat(MAX_NAME_LEN - 1));
        let dns = DnsInfo::new(0, &s, "");
        assert_eq!(dns.domain.len(), MAX_NAME_LEN - 1);
        assert!(dns.domain.chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_lineage_packing_round_trips() {
        let process = ProcessInfo {
            pid: 4321,
            ppid: 1,
            ..Default::default()
        };
        let packed = process.packed_lineage();
        assert_eq!(ProcessInfo::unpack_lineage(packed), (4321, 1));

        // Negative pids survive the round trip.
        let odd = ProcessInfo {
            pid: -1,
            ppid: 77,
            ..Default::default()
        };
        assert_eq!(ProcessInfo::unpack_lineage(odd.packed_lineage()), (-1, 77));
    }

    #[test]
    fn test_rename_payload_bounds_the_destination_path() {
        let record = EventRecord::new(
            EventKind::NotifyFileRename,
            9,
            ProcessInfo::default(),
            EventPayload::Rename {
                source: FileInfo::new(0, 0, 0o600, "/tmp/a"),
                new_path: "y".repeat(MAX_PATH_LEN * 2),
            },
        );
        match record.payload {
            EventPayload::Rename { new_path, .. } => assert_eq!(new_path.len(), MAX_PATH_LEN),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_record_serializes_for_the_feed() {
        let record = EventRecord::new(
            EventKind::NotifyDnsResolve,
            3,
            ProcessInfo::default(),
            EventPayload::Dns(DnsInfo::new(0, "example.com", "93.184.216.34")),
        );
        let json = serde_json::to_string(&record).expect("serialize");
        let back: EventRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, record);
    }
}
