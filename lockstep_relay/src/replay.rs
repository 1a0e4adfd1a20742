// Replay recording and reconstruction.
//
// File format: a sequence of records
//
//     int32 clientIndex | int32 length | packet[length]
//
// where `packet` is `int32 frame | payload`, exactly what the relay received
// or authored. A record with `clientIndex == -1` marks the start of the
// metadata trailer: `int32 length | JSON bytes`.
//
// `ReplayRecorder` writes this format while a game runs. `Replay` reads it
// back into frame-ordered `ReplayChunk`s, the same per-frame grouping the
// live scheduler produces:
//
// - Disconnect and sync-hash records are skipped (they are regenerated live),
//   but disconnects are remembered so resumed sessions know who left.
// - Two records from the same client for the same frame inside one chunk are
//   merged: the second packet's frame word is stripped and its payload is
//   appended to the first.
// - A chunk closes when a synchronized record for a different frame arrives.
//   Immediate records join whichever chunk is open, so chat is paced with the
//   game instead of all arriving at frame zero.
//
// In `Viewer` mode chunks are released by `receive(current_frame)` as the
// consumer's frame reaches them. In `Resume` mode server orders (lobby sync,
// game start, chat) are skipped as well, since the live relay authors its
// own; the final frame is dropped as a possibly incomplete tail and one
// unpause order per surviving client is appended on the following frame.

use std::collections::{BTreeSet, VecDeque};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use lockstep_protocol::order::{self, encode_fields_order};
use lockstep_protocol::{ClientIndex, Frame, MAX_PACKET_SIZE};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Client index that marks the metadata trailer.
pub const META_START_MARKER: i32 = -1;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("replay I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("replay truncated inside a record")]
    Truncated,

    #[error("malformed replay record: {0}")]
    Malformed(String),

    #[error("malformed replay metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayPlayer {
    pub index: ClientIndex,
    pub name: String,
    pub team: i32,
    pub slot: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayMetadata {
    #[serde(rename = "mod")]
    pub mod_id: String,
    pub version: String,
    pub map: String,
    /// Seconds since the Unix epoch.
    pub start_time: u64,
    pub players: Vec<ReplayPlayer>,
}

/// One raw record: sender plus `frame | payload` bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayRecord {
    pub client: ClientIndex,
    pub packet: Vec<u8>,
}

impl ReplayRecord {
    pub fn frame(&self) -> Frame {
        packet_frame(&self.packet)
    }

    pub fn payload(&self) -> &[u8] {
        &self.packet[4..]
    }

    fn is_disconnect(&self) -> bool {
        order::is_disconnect(self.payload())
    }

    fn is_sync(&self) -> bool {
        order::is_sync_hash(self.payload())
    }

    fn is_server_order(&self) -> bool {
        order::is_server_order(self.payload())
    }
}

fn packet_frame(packet: &[u8]) -> Frame {
    Frame(i32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayChunk {
    pub frame: Frame,
    /// `(sender, frame | payload)` in file order.
    pub packets: Vec<(ClientIndex, Vec<u8>)>,
}

impl ReplayChunk {
    fn new() -> Self {
        Self {
            frame: Frame::IMMEDIATE,
            packets: Vec::new(),
        }
    }

    /// `(sender, frame, payload)` for every packet, ready to be framed for
    /// relaying.
    pub fn relay_packets(&self) -> impl Iterator<Item = (ClientIndex, Frame, &[u8])> + '_ {
        self.packets
            .iter()
            .map(|(client, packet)| (*client, packet_frame(packet), &packet[4..]))
    }

    fn add(&mut self, record: ReplayRecord) {
        let frame = record.frame();
        let existing = self
            .packets
            .iter_mut()
            .find(|(client, packet)| *client == record.client && packet_frame(packet) == frame);
        match existing {
            Some((_, packet)) => packet.extend_from_slice(&record.packet[4..]),
            None => self.packets.push((record.client, record.packet)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayMode {
    Viewer,
    Resume,
}

fn read_i32_or_eof<R: Read>(reader: &mut R) -> Result<Option<i32>, ReplayError> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ReplayError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(i32::from_le_bytes(buf)))
}

fn read_len<R: Read>(reader: &mut R) -> Result<usize, ReplayError> {
    let len = read_i32_or_eof(reader)?.ok_or(ReplayError::Truncated)?;
    if len < 0 || len as usize > MAX_PACKET_SIZE {
        return Err(ReplayError::Malformed(format!("invalid length {len}")));
    }
    Ok(len as usize)
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, ReplayError> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => ReplayError::Truncated,
        _ => ReplayError::Io(e),
    })?;
    Ok(buf)
}

/// Read every record up to the metadata marker, plus the metadata if present.
pub fn read_records<R: Read>(
    reader: &mut R,
) -> Result<(Vec<ReplayRecord>, Option<ReplayMetadata>), ReplayError> {
    let mut records = Vec::new();
    while let Some(client) = read_i32_or_eof(reader)? {
        if client == META_START_MARKER {
            let len = read_len(reader)?;
            let json = read_exact_or_truncated(reader, len)?;
            let metadata = serde_json::from_slice(&json)?;
            return Ok((records, Some(metadata)));
        }
        let len = read_len(reader)?;
        if len < 4 {
            return Err(ReplayError::Malformed(format!(
                "packet of {len} bytes has no frame number"
            )));
        }
        let packet = read_exact_or_truncated(reader, len)?;
        records.push(ReplayRecord {
            client: ClientIndex(client),
            packet,
        });
    }
    Ok((records, None))
}

/// A parsed replay, ready to be played back or resumed.
#[derive(Debug)]
pub struct Replay {
    chunks: VecDeque<ReplayChunk>,
    pub metadata: Option<ReplayMetadata>,
    /// Every client that sent something.
    pub clients: BTreeSet<ClientIndex>,
    /// Clients whose disconnect marker was recorded.
    pub disconnected: BTreeSet<ClientIndex>,
    last_frame: Frame,
    resume_frame: Option<Frame>,
}

impl Replay {
    pub fn open(path: &Path, mode: ReplayMode) -> Result<Self, ReplayError> {
        let mut reader = BufReader::new(File::open(path)?);
        Self::from_reader(&mut reader, mode)
    }

    pub fn from_reader<R: Read>(reader: &mut R, mode: ReplayMode) -> Result<Self, ReplayError> {
        let (records, metadata) = read_records(reader)?;
        Ok(Self::from_records(records, metadata, mode))
    }

    pub fn from_records(
        records: Vec<ReplayRecord>,
        metadata: Option<ReplayMetadata>,
        mode: ReplayMode,
    ) -> Self {
        let mut chunks = VecDeque::new();
        let mut clients = BTreeSet::new();
        let mut disconnected = BTreeSet::new();
        let mut current = ReplayChunk::new();
        let mut last_frame = Frame::IMMEDIATE;

        for record in records {
            if record.packet.len() < 4 {
                continue;
            }
            if record.is_disconnect() {
                disconnected.insert(record.client);
                continue;
            }
            if record.is_sync() || (mode == ReplayMode::Resume && record.is_server_order()) {
                continue;
            }
            clients.insert(record.client);

            let frame = record.frame();
            if !frame.is_immediate() {
                if !current.frame.is_immediate() && current.frame != frame {
                    chunks.push_back(std::mem::replace(&mut current, ReplayChunk::new()));
                }
                current.frame = frame;
                last_frame = last_frame.max(frame);
            }
            current.add(record);
        }
        if !current.packets.is_empty() {
            if current.frame.is_immediate() {
                current.frame = last_frame;
            }
            chunks.push_back(current);
        }

        let mut replay = Self {
            chunks,
            metadata,
            clients,
            disconnected,
            last_frame,
            resume_frame: None,
        };
        if mode == ReplayMode::Resume {
            replay.prepare_resume();
        }
        replay
    }

    fn prepare_resume(&mut self) {
        let last = self.last_frame;
        if !last.is_immediate() {
            while self.chunks.back().is_some_and(|c| c.frame == last) {
                self.chunks.pop_back();
            }
        }
        let retained = self
            .chunks
            .back()
            .map_or(Frame::IMMEDIATE, |c| c.frame);
        let resume = retained.next();

        let unpause = encode_fields_order("PauseGame", Some("UnPause"));
        let packets = self
            .clients
            .iter()
            .filter(|c| !self.disconnected.contains(c))
            .map(|&client| {
                let mut packet = resume.0.to_le_bytes().to_vec();
                packet.extend_from_slice(&unpause);
                (client, packet)
            })
            .collect();
        self.chunks.push_back(ReplayChunk {
            frame: resume,
            packets,
        });
        self.last_frame = resume;
        self.resume_frame = Some(resume);
    }

    /// Release every chunk whose frame the consumer has reached.
    pub fn receive(&mut self, current: Frame) -> Vec<ReplayChunk> {
        let mut ready = Vec::new();
        while self.chunks.front().is_some_and(|c| c.frame <= current) {
            if let Some(chunk) = self.chunks.pop_front() {
                ready.push(chunk);
            }
        }
        ready
    }

    /// Frame of the synthesized unpause chunk, in resume mode.
    pub fn resume_frame(&self) -> Option<Frame> {
        self.resume_frame
    }

    pub fn last_frame(&self) -> Frame {
        self.last_frame
    }

    pub fn is_finished(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn into_chunks(self) -> Vec<ReplayChunk> {
        self.chunks.into()
    }
}

/// Writes the replay of a running game. The first I/O error disables it.
#[derive(Debug)]
pub struct ReplayRecorder {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
}

impl ReplayRecorder {
    /// Create a new, uniquely named replay file in `dir`.
    pub fn create(dir: &Path, start_time: u64) -> Result<Self, ReplayError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "replay-{start_time}-{:08x}.lsr",
            rand::random::<u32>()
        ));
        let file = File::create(&path)?;
        info!(path = %path.display(), "recording replay");
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            path,
        })
    }

    pub fn record(&mut self, from: ClientIndex, frame: Frame, payload: &[u8]) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = (|| -> io::Result<()> {
            writer.write_all(&from.0.to_le_bytes())?;
            writer.write_all(&((payload.len() + 4) as i32).to_le_bytes())?;
            writer.write_all(&frame.0.to_le_bytes())?;
            writer.write_all(payload)
        })();
        if let Err(e) = result {
            warn!(error = %e, path = %self.path.display(), "replay recording failed; disabling recorder");
            self.writer = None;
        }
    }

    /// Write the metadata trailer and close the file.
    pub fn finish(mut self, metadata: &ReplayMetadata) -> Option<PathBuf> {
        let mut writer = self.writer.take()?;
        let result = (|| -> Result<(), ReplayError> {
            let json = serde_json::to_vec(metadata)?;
            writer.write_all(&META_START_MARKER.to_le_bytes())?;
            writer.write_all(&(json.len() as i32).to_le_bytes())?;
            writer.write_all(&json)?;
            writer.flush()?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                info!(path = %self.path.display(), "replay saved");
                Some(self.path)
            }
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "failed to finish replay");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use lockstep_protocol::order::{ServerOrder, SyncHash, disconnect_order, names};

    use super::*;

    fn record(client: i32, frame: i32, payload: &[u8]) -> ReplayRecord {
        let mut packet = frame.to_le_bytes().to_vec();
        packet.extend_from_slice(payload);
        ReplayRecord {
            client: ClientIndex(client),
            packet,
        }
    }

    fn write_file(records: &[ReplayRecord], metadata: Option<&ReplayMetadata>) -> Vec<u8> {
        let mut out = Vec::new();
        for r in records {
            out.extend_from_slice(&r.client.0.to_le_bytes());
            out.extend_from_slice(&(r.packet.len() as i32).to_le_bytes());
            out.extend_from_slice(&r.packet);
        }
        if let Some(metadata) = metadata {
            let json = serde_json::to_vec(metadata).unwrap();
            out.extend_from_slice(&META_START_MARKER.to_le_bytes());
            out.extend_from_slice(&(json.len() as i32).to_le_bytes());
            out.extend_from_slice(&json);
        }
        out
    }

    #[test]
    fn same_frame_records_merge() {
        let a = record(3, 5, &[1, 2]);
        let b = record(3, 5, &[3]);
        let replay = Replay::from_records(vec![a.clone(), b.clone()], None, ReplayMode::Viewer);
        let chunks = replay.into_chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].packets.len(), 1);

        let mut expected = a.packet.clone();
        expected.extend_from_slice(&b.packet[4..]);
        assert_eq!(chunks[0].packets[0], (ClientIndex(3), expected));
    }

    #[test]
    fn different_clients_same_frame_share_a_chunk() {
        let replay = Replay::from_records(
            vec![record(0, 1, b"a"), record(1, 1, b"b"), record(0, 2, b"c")],
            None,
            ReplayMode::Viewer,
        );
        let chunks = replay.into_chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].frame, Frame(1));
        assert_eq!(chunks[0].packets.len(), 2);
        assert_eq!(chunks[1].frame, Frame(2));
    }

    #[test]
    fn disconnect_and_sync_records_are_filtered() {
        let sync = SyncHash {
            hash: 1,
            defeat_state: 0,
        }
        .serialize();
        let replay = Replay::from_records(
            vec![
                record(0, 1, b"x"),
                record(1, 1, &sync),
                record(1, 2, &disconnect_order()),
                record(0, 2, b"y"),
            ],
            None,
            ReplayMode::Viewer,
        );
        assert!(replay.disconnected.contains(&ClientIndex(1)));
        assert!(!replay.clients.contains(&ClientIndex(1)));
        let chunks = replay.into_chunks();
        let total: usize = chunks.iter().map(|c| c.packets.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn viewer_paces_immediate_orders_with_frames() {
        let mut replay = Replay::from_records(
            vec![
                record(0, 0, b"lobby"),
                record(0, 1, b"o1"),
                record(1, 0, b"chat"),
                record(0, 4, b"o4"),
            ],
            None,
            ReplayMode::Viewer,
        );
        let first = replay.receive(Frame(0));
        assert!(first.is_empty());

        let at_one = replay.receive(Frame(1));
        assert_eq!(at_one.len(), 1);
        let payloads: Vec<&[u8]> = at_one[0].packets.iter().map(|(_, p)| &p[4..]).collect();
        assert_eq!(payloads, vec![&b"lobby"[..], b"o1", b"chat"]);

        assert!(replay.receive(Frame(3)).is_empty());
        assert_eq!(replay.receive(Frame(10)).len(), 1);
        assert!(replay.is_finished());
    }

    #[test]
    fn resume_drops_tail_and_appends_unpause() {
        let replay = Replay::from_records(
            vec![
                record(0, 1, b"a"),
                record(1, 1, b"b"),
                record(2, 2, b"c"),
                record(2, 3, &disconnect_order()),
                record(0, 3, b"tail"),
            ],
            None,
            ReplayMode::Resume,
        );
        assert_eq!(replay.resume_frame(), Some(Frame(3)));
        let chunks = replay.into_chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].frame, Frame(2));

        let unpause = &chunks[2];
        assert_eq!(unpause.frame, Frame(3));
        let who: Vec<ClientIndex> = unpause.packets.iter().map(|(c, _)| *c).collect();
        assert_eq!(who, vec![ClientIndex(0), ClientIndex(1)]);
        let packet = &unpause.packets[0].1;
        assert_eq!(packet_frame(packet), Frame(3));
        assert_eq!(&packet[4..], &encode_fields_order("PauseGame", Some("UnPause"))[..]);
    }

    #[test]
    fn resume_skips_server_orders_but_viewer_keeps_them() {
        let records = vec![
            record(0, 0, &ServerOrder::new(names::SYNC_INFO, "{}").serialize()),
            record(0, 0, &ServerOrder::new(names::START_GAME, "").serialize()),
            record(3, 0, &ServerOrder::new(names::CHAT, "gl hf").serialize()),
            record(1, 1, b"a"),
            record(1, 2, b"b"),
        ];

        let viewer = Replay::from_records(records.clone(), None, ReplayMode::Viewer);
        let chunks = viewer.into_chunks();
        assert_eq!(chunks[0].frame, Frame(1));
        assert_eq!(chunks[0].packets.len(), 3);

        let resume = Replay::from_records(records, None, ReplayMode::Resume);
        assert_eq!(resume.resume_frame(), Some(Frame(2)));
        let chunks = resume.into_chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].packets, vec![(ClientIndex(1), record(1, 1, b"a").packet)]);
        // Clients that only sent server orders get no unpause.
        let who: Vec<ClientIndex> = chunks[1].packets.iter().map(|(c, _)| *c).collect();
        assert_eq!(who, vec![ClientIndex(1)]);
    }

    #[test]
    fn metadata_trailer_is_read() {
        let metadata = ReplayMetadata {
            mod_id: "ra".into(),
            version: "dev".into(),
            map: "abc".into(),
            start_time: 42,
            players: Vec::new(),
        };
        let bytes = write_file(&[record(0, 1, b"x")], Some(&metadata));
        let (records, meta) = read_records(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(meta, Some(metadata));
    }

    #[test]
    fn truncated_record_is_error() {
        let mut bytes = write_file(&[record(0, 1, b"xyz")], None);
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            read_records(&mut Cursor::new(bytes)),
            Err(ReplayError::Truncated)
        ));
    }

    #[test]
    fn recorder_output_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = ReplayRecorder::create(dir.path(), 1000).unwrap();
        recorder.record(ClientIndex(0), Frame(0), b"hello");
        recorder.record(ClientIndex(1), Frame(2), b"order");
        let metadata = ReplayMetadata {
            mod_id: "ra".into(),
            ..ReplayMetadata::default()
        };
        let path = recorder.finish(&metadata).unwrap();

        let replay = Replay::open(&path, ReplayMode::Viewer).unwrap();
        assert_eq!(replay.metadata, Some(metadata));
        assert_eq!(replay.last_frame(), Frame(2));
        let chunks = replay.into_chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].packets[1].0, ClientIndex(1));
        assert_eq!(&chunks[0].packets[1].1[4..], b"order");
    }
}
