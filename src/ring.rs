/*! Live extraction: a packet ring plus a background writer thread.

Every dispatched packet is appended to a fixed-size ring (a 16-byte
record header followed by the raw bytes; the oldest records are evicted
by reading their headers). When any decoder raises the
[`LIVE_EXTRACT`](crate::flow::LIVE_EXTRACT) bit on a flow, the flow's
outstanding ring offsets move onto a shared to-extract queue, and a
single background thread writes the surviving records to an output PCAP.
Offsets overwritten in the ring before extraction are silently skipped.
*/

use crate::config::DecoderConfig;
use crate::error::{Error, Result};
use crate::flow::{Flow, FlowTable, LIVE_EXTRACT};
use crate::packet::{Packet, Timestamp};
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, RecordBuilder};
use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::*;

const RECORD_HDR_LEN: u64 = 16;
const PCAP_FILE_HDR_LEN: u64 = 24;
const MAX_PKT_SIZE: usize = 65536;
/// Queue sentinel telling the writer to switch output files.
const SWITCH_PCAP: u64 = u64::MAX;

#[derive(Clone, Debug)]
pub struct RingOptions {
    pub base: DecoderConfig,
    /// Ring capacity in bytes.
    pub capacity: usize,
    /// Link type written to the output PCAP header.
    pub link_type: u32,
    /// In split mode, rotate on terminated-flow count instead of bytes.
    pub split_by_flows: bool,
}

impl Default for RingOptions {
    fn default() -> RingOptions {
        RingOptions {
            base: DecoderConfig::default(),
            capacity: 1 << 31,
            link_type: 1, // Ethernet
            split_by_flows: false,
        }
    }
}

/// Byte ring addressed by monotonically increasing offsets; `start` and
/// `end` only ever grow, the physical position is the offset modulo the
/// capacity.
struct ByteRing {
    buf: Vec<u8>,
    start: u64,
    end: u64,
}

impl ByteRing {
    fn new(capacity: usize) -> ByteRing {
        ByteRing {
            buf: vec![0; capacity],
            start: 0,
            end: 0,
        }
    }

    fn capacity(&self) -> u64 {
        self.buf.len() as u64
    }

    fn copy_out(&self, offset: u64, dst: &mut [u8]) {
        let cap = self.buf.len();
        let mut pos = (offset % self.capacity()) as usize;
        for b in dst.iter_mut() {
            *b = self.buf[pos];
            pos = (pos + 1) % cap;
        }
    }

    fn copy_in(&mut self, offset: u64, src: &[u8]) {
        let cap = self.buf.len();
        let mut pos = (offset % self.capacity()) as usize;
        for &b in src {
            self.buf[pos] = b;
            pos = (pos + 1) % cap;
        }
    }

    /// Append one record, evicting the oldest records until it fits.
    /// Returns the record's offset.
    fn append(&mut self, header: &[u8; 16], data: &[u8]) -> std::result::Result<u64, Error> {
        let need = RECORD_HDR_LEN + data.len() as u64;
        if need > self.capacity() {
            return Err(Error::PacketTooLarge(data.len()));
        }
        while self.start + self.capacity() - self.end < need {
            let mut victim = [0u8; 16];
            self.copy_out(self.start, &mut victim);
            let caplen = u32::from_le_bytes([victim[8], victim[9], victim[10], victim[11]]);
            self.start += RECORD_HDR_LEN + u64::from(caplen);
        }
        let offset = self.end;
        self.copy_in(offset, header);
        self.copy_in(offset + RECORD_HDR_LEN, data);
        self.end += need;
        Ok(offset)
    }
}

fn record_header(ts: Timestamp, caplen: u32, wire_len: u32) -> [u8; 16] {
    let mut hdr = [0u8; 16];
    hdr[0..4].copy_from_slice(&(ts.sec as u32).to_le_bytes());
    hdr[4..8].copy_from_slice(&ts.usec.to_le_bytes());
    hdr[8..12].copy_from_slice(&caplen.to_le_bytes());
    hdr[12..16].copy_from_slice(&wire_len.to_le_bytes());
    hdr
}

struct Shared {
    ring: ByteRing,
    to_extract: VecDeque<u64>,
}

#[derive(Default)]
struct XtrFlow {
    offsets: VecDeque<u64>,
    extract: bool,
}

struct Writer {
    shared: Arc<(Mutex<Shared>, Condvar)>,
    stop: Arc<AtomicBool>,
    extracted: Arc<AtomicU64>,
    path: PathBuf,
    link_type: u32,
    split: Option<u64>,
    split_by_flows: bool,
    index: u64,
}

impl Writer {
    fn current_path(&self) -> PathBuf {
        if self.split.is_some() {
            let mut name = self.path.file_name().unwrap_or_default().to_os_string();
            name.push(self.index.to_string());
            self.path.with_file_name(name)
        } else {
            self.path.clone()
        }
    }

    fn open(&self) -> std::io::Result<File> {
        let path = self.current_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        let mut hdr = Vec::with_capacity(PCAP_FILE_HDR_LEN as usize);
        hdr.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        hdr.extend_from_slice(&2u16.to_le_bytes());
        hdr.extend_from_slice(&4u16.to_le_bytes());
        hdr.extend_from_slice(&0u32.to_le_bytes()); // thiszone
        hdr.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        hdr.extend_from_slice(&(MAX_PKT_SIZE as u32).to_le_bytes());
        hdr.extend_from_slice(&self.link_type.to_le_bytes());
        file.write_all(&hdr)?;
        Ok(file)
    }

    fn run(mut self) {
        let mut file = match self.open() {
            Ok(f) => f,
            Err(e) => {
                error!("failed to open extraction PCAP: {e}");
                return;
            }
        };
        let mut written = PCAP_FILE_HDR_LEN;
        let mut record = vec![0u8; 16 + MAX_PKT_SIZE];
        loop {
            let popped = {
                let (lock, cvar) = &*self.shared;
                let mut shared = lock.lock().unwrap();
                loop {
                    if let Some(offset) = shared.to_extract.pop_front() {
                        if offset == SWITCH_PCAP {
                            break Some((offset, 0));
                        }
                        if offset < shared.ring.start {
                            // Already overwritten in the ring.
                            continue;
                        }
                        shared.ring.copy_out(offset, &mut record[..16]);
                        let caplen = u32::from_le_bytes([
                            record[8], record[9], record[10], record[11],
                        ]) as usize;
                        if caplen > MAX_PKT_SIZE {
                            warn!("packet too large to be extracted");
                            continue;
                        }
                        shared
                            .ring
                            .copy_out(offset + RECORD_HDR_LEN, &mut record[16..16 + caplen]);
                        break Some((offset, caplen));
                    }
                    if self.stop.load(Ordering::Acquire) {
                        break None;
                    }
                    let (guard, _) = cvar
                        .wait_timeout(shared, Duration::from_millis(1))
                        .unwrap();
                    shared = guard;
                }
            };

            let Some((offset, caplen)) = popped else {
                break;
            };

            let rotate_on_bytes = !self.split_by_flows
                && self
                    .split
                    .map(|threshold| written > threshold)
                    .unwrap_or(false);
            if offset == SWITCH_PCAP || rotate_on_bytes {
                self.index += 1;
                match self.open() {
                    Ok(f) => file = f,
                    Err(e) => {
                        error!("failed to open extraction PCAP: {e}");
                        return;
                    }
                }
                written = PCAP_FILE_HDR_LEN;
                if offset == SWITCH_PCAP {
                    continue;
                }
            }

            if let Err(e) = file.write_all(&record[..16 + caplen]) {
                error!("failed to write extracted packet: {e}");
                return;
            }
            written += RECORD_HDR_LEN + caplen as u64;
            self.extracted.fetch_add(1, Ordering::Relaxed);
        }

        drop(file);
        // An output holding only its header is useless; remove it.
        if written == PCAP_FILE_HDR_LEN {
            let _ = std::fs::remove_file(self.current_path());
        }
    }
}

pub struct RingExtractor {
    flows: Vec<XtrFlow>,
    shared: Arc<(Mutex<Shared>, Condvar)>,
    stop: Arc<AtomicBool>,
    extracted: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
    options: RingOptions,
    terminated_flows: u64,
    packets: u64,
}

impl RingExtractor {
    pub fn new(flow_capacity: usize, options: RingOptions) -> RingExtractor {
        let shared = Arc::new((
            Mutex::new(Shared {
                ring: ByteRing::new(options.capacity),
                to_extract: VecDeque::new(),
            }),
            Condvar::new(),
        ));
        let stop = Arc::new(AtomicBool::new(false));
        let extracted = Arc::new(AtomicU64::new(0));

        let suffix = if options.base.file_suffix.is_empty() {
            "_livextr.pcap".to_owned()
        } else {
            options.base.file_suffix.clone()
        };
        let writer = Writer {
            shared: Arc::clone(&shared),
            stop: Arc::clone(&stop),
            extracted: Arc::clone(&extracted),
            path: options
                .base
                .output_dir
                .join(format!("{}{}", options.base.file_prefix, suffix)),
            link_type: options.link_type,
            split: options
                .base
                .split_output
                .then_some(options.base.split_threshold),
            split_by_flows: options.split_by_flows,
            index: 0,
        };
        let thread = std::thread::Builder::new()
            .name("ring-extractor".into())
            .spawn(move || writer.run())
            .expect("failed to start extraction thread");

        RingExtractor {
            flows: (0..flow_capacity).map(|_| XtrFlow::default()).collect(),
            shared,
            stop,
            extracted,
            thread: Some(thread),
            options,
            terminated_flows: 0,
            packets: 0,
        }
    }

    /// Drop per-flow offsets whose records were already overwritten.
    fn clean_overwritten(offsets: &mut VecDeque<u64>, start: u64) {
        while offsets.front().map(|&o| o < start).unwrap_or(false) {
            offsets.pop_front();
        }
    }
}

impl Decoder for RingExtractor {
    fn name(&self) -> &'static str {
        "liveXtr"
    }

    fn header(&self) -> Vec<Column> {
        Vec::new()
    }

    fn on_new_flow(&mut self, _packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        self.flows[flow.index.0] = XtrFlow::default();
    }

    fn on_layer4(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        self.packets += 1;
        let header = record_header(packet.timestamp, packet.raw.len() as u32, packet.wire_len);
        let state = &mut self.flows[flow.index.0];

        let (lock, cvar) = &*self.shared;
        let mut shared = lock.lock().unwrap();
        let offset = match shared.ring.append(&header, packet.raw) {
            Ok(o) => o,
            Err(e) => {
                warn!("flow {}: {e}", flow.findex);
                return;
            }
        };
        if !state.extract {
            Self::clean_overwritten(&mut state.offsets, shared.ring.start);
            state.offsets.push_back(offset);
        }
        if flow.status() & LIVE_EXTRACT == 0 {
            return;
        }
        if !state.extract {
            // Newly flagged: queue everything still resident in the ring.
            while let Some(o) = state.offsets.pop_front() {
                shared.to_extract.push_back(o);
            }
            state.extract = true;
        } else {
            shared.to_extract.push_back(offset);
        }
        drop(shared);
        cvar.notify_one();
    }

    fn on_flow_terminate(
        &mut self,
        flow: &Flow,
        _flows: &FlowTable,
        _record: &mut RecordBuilder,
    ) -> Result<()> {
        let state = &mut self.flows[flow.index.0];
        if flow.status() & LIVE_EXTRACT != 0 && !state.extract {
            // Flagged after the flow's last packet.
            let (lock, cvar) = &*self.shared;
            let mut shared = lock.lock().unwrap();
            let start = shared.ring.start;
            Self::clean_overwritten(&mut state.offsets, start);
            while let Some(o) = state.offsets.pop_front() {
                shared.to_extract.push_back(o);
            }
            drop(shared);
            cvar.notify_one();
        }
        state.offsets = VecDeque::new();
        state.extract = false;

        if self.options.base.split_output && self.options.split_by_flows {
            self.terminated_flows += 1;
            if self.terminated_flows >= self.options.base.split_threshold {
                let (lock, cvar) = &*self.shared;
                lock.lock().unwrap().to_extract.push_back(SWITCH_PCAP);
                cvar.notify_one();
                self.terminated_flows = 0;
            }
        }
        Ok(())
    }

    fn report(&self) -> DecoderReport {
        DecoderReport {
            status: 0,
            packets: self.packets,
            units: self.extracted.load(Ordering::Relaxed),
        }
    }

    fn finalize(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.shared.1.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RingExtractor {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.finalize();
        }
    }
}
