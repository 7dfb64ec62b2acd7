//! NTLMSSP decoder: negotiate/challenge/authenticate messages inside
//! SMB, HTTP or mail streams, plus NetNTLM hash extraction.

use crate::config::DecoderConfig;
use crate::cursor::{ByteCursor, StrEncoding};
use crate::error::{ParseError, Result};
use crate::flow::{Flow, FlowTable};
use crate::packet::Packet;
use crate::runtime::{Decoder, DecoderReport};
use crate::schema::{Column, ColumnType, RecordBuilder};
use std::fs::File;
use std::io::Write;
use tracing::*;

pub const NTLMSSP_STAT_NTLMSSP: u8 = 0x01; // flow is NTLMSSP
pub const NTLMSSP_STAT_NEGOTIATE: u8 = 0x02;
pub const NTLMSSP_STAT_CHALLENGE: u8 = 0x04;
pub const NTLMSSP_STAT_AUTHENTICATE: u8 = 0x08;
pub const NTLMSSP_STAT_HASH_V1: u8 = 0x10; // NetNTLMv1 hash extracted
pub const NTLMSSP_STAT_HASH_V2: u8 = 0x20; // NetNTLMv2 hash extracted
pub const NTLMSSP_STAT_TRUNC: u8 = 0x40; // string output truncated
pub const NTLMSSP_STAT_MALFORMED: u8 = 0x80; // decoding error

const NTLMSSP_MAGIC: &[u8] = b"NTLMSSP\0";

const MSG_NEGOTIATE: u32 = 0x0000_0001;
const MSG_CHALLENGE: u32 = 0x0000_0002;
const MSG_AUTHENTICATE: u32 = 0x0000_0003;

const FLAG_NEGOTIATE_VERSION: u32 = 0x0200_0000;

const NAME_LEN: usize = 64; // max length for string output

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
struct NtlmVersion {
    major: u8,
    minor: u8,
    build: u16,
    revision: u8,
}

#[derive(Clone, Default)]
struct NtlmFlow {
    status: u8,
    nego_flags: u32,
    version: NtlmVersion,
    timestamp: u64,
    server_challenge: String,
    nt_proof: String,
    session_key: String,
    client_challenge: String,
    target: String,
    domain: String,
    user: String,
    workstation: String,
    nb_computer: String,
    nb_domain: String,
    dns_computer: String,
    dns_domain: String,
    dns_tree: String,
    attr_target: String,
    /// 1 for NetNTLMv1, 2 for NetNTLMv2, 0 when no authenticate was seen.
    auth_type: u8,
}

pub struct NtlmsspDecoder {
    flows: Vec<NtlmFlow>,
    config: DecoderConfig,
    packets: u64,
    hashes: u64,
    agg_status: u8,
    v1_file: Option<File>,
    v2_file: Option<File>,
}

impl NtlmsspDecoder {
    pub fn new(flow_capacity: usize, config: DecoderConfig) -> NtlmsspDecoder {
        if config.enable_save {
            if let Err(e) = config.prepare_output_dir() {
                warn!("failed to prepare {}: {e}", config.output_dir.display());
            }
        }
        NtlmsspDecoder {
            flows: vec![NtlmFlow::default(); flow_capacity],
            config,
            packets: 0,
            hashes: 0,
            agg_status: 0,
            v1_file: None,
            v2_file: None,
        }
    }

    /// Bounded UTF-16LE payload string; all offsets are relative to the
    /// NTLMSSP anchor.
    fn read_name(
        state: &mut NtlmFlow,
        cur: &mut ByteCursor,
        anchor: usize,
        off: u32,
        len: u16,
    ) -> String {
        if len == 0 {
            return String::new();
        }
        cur.seek(anchor + off as usize);
        match cur.read_str(NAME_LEN, len as usize, StrEncoding::Utf16Le) {
            Ok(s) => {
                if s.truncated {
                    state.status |= NTLMSSP_STAT_TRUNC;
                }
                s.value
            }
            Err(_) => {
                state.status |= NTLMSSP_STAT_MALFORMED;
                String::new()
            }
        }
    }

    /// Length/max-length/offset field triple.
    fn field(cur: &mut ByteCursor) -> std::result::Result<(u16, u32), ParseError> {
        let len = cur.read_le_u16()?;
        cur.skip(2)?; // max length
        let off = cur.read_le_u32()?;
        Ok((len, off))
    }

    fn read_version(state: &mut NtlmFlow, cur: &mut ByteCursor) -> std::result::Result<(), ParseError> {
        state.version.major = cur.read_u8()?;
        state.version.minor = cur.read_u8()?;
        state.version.build = cur.read_le_u16()?;
        cur.skip(3)?;
        state.version.revision = cur.read_u8()?;
        Ok(())
    }

    fn av_pairs(state: &mut NtlmFlow, cur: &mut ByteCursor, len: u16) {
        let mut left = len as usize;
        while left >= 4 && cur.remaining() >= 4 {
            let (avid, avlen) = match (cur.read_le_u16(), cur.read_le_u16()) {
                (Ok(id), Ok(l)) => (id, l),
                _ => return,
            };
            left = left.saturating_sub(4 + avlen as usize);
            let result = match avid {
                0x0000 => return, // MsvAvEOL
                0x0001 => {
                    let name = Self::read_av_name(state, cur, avlen);
                    state.nb_computer = name;
                    Ok(())
                }
                0x0002 => {
                    let name = Self::read_av_name(state, cur, avlen);
                    state.nb_domain = name;
                    Ok(())
                }
                0x0003 => {
                    let name = Self::read_av_name(state, cur, avlen);
                    state.dns_computer = name;
                    Ok(())
                }
                0x0004 => {
                    let name = Self::read_av_name(state, cur, avlen);
                    state.dns_domain = name;
                    Ok(())
                }
                0x0005 => {
                    let name = Self::read_av_name(state, cur, avlen);
                    state.dns_tree = name;
                    Ok(())
                }
                0x0007 => match cur.read_le_u64() {
                    Ok(ts) => {
                        state.timestamp = ts;
                        Ok(())
                    }
                    Err(e) => Err(e),
                },
                0x0009 => {
                    let name = Self::read_av_name(state, cur, avlen);
                    state.attr_target = name;
                    Ok(())
                }
                // Flags, single host, channel bindings, unknown ids.
                _ => cur.skip(avlen as usize),
            };
            if result.is_err() {
                return;
            }
        }
    }

    fn read_av_name(state: &mut NtlmFlow, cur: &mut ByteCursor, len: u16) -> String {
        match cur.read_str(NAME_LEN, len as usize, StrEncoding::Utf16Le) {
            Ok(s) => {
                if s.truncated {
                    state.status |= NTLMSSP_STAT_TRUNC;
                }
                s.value
            }
            Err(_) => {
                state.status |= NTLMSSP_STAT_MALFORMED;
                String::new()
            }
        }
    }

    fn negotiate(state: &mut NtlmFlow, cur: &mut ByteCursor, anchor: usize) {
        let parsed = (|| {
            let flags = cur.read_le_u32()?;
            state.nego_flags |= flags;
            let (dlen, doff) = Self::field(cur)?;
            let (wlen, woff) = Self::field(cur)?;
            if flags & FLAG_NEGOTIATE_VERSION != 0 {
                Self::read_version(state, cur)?;
            }
            Ok::<_, ParseError>(((dlen, doff), (wlen, woff)))
        })();
        let ((dlen, doff), (wlen, woff)) = match parsed {
            Ok(f) => f,
            Err(_) => return,
        };
        state.domain = Self::read_name(state, cur, anchor, doff, dlen);
        state.workstation = Self::read_name(state, cur, anchor, woff, wlen);
    }

    fn challenge(state: &mut NtlmFlow, cur: &mut ByteCursor, anchor: usize) {
        let parsed = (|| {
            let (tnlen, tnoff) = Self::field(cur)?;
            let flags = cur.read_le_u32()?;
            state.nego_flags |= flags;
            let challenge = cur.read_hex(8)?;
            let reserved = cur.read_le_u64()?;
            if reserved != 0 {
                state.status |= NTLMSSP_STAT_MALFORMED;
            }
            let (tilen, tioff) = Self::field(cur)?;
            if flags & FLAG_NEGOTIATE_VERSION != 0 {
                Self::read_version(state, cur)?;
            }
            Ok::<_, ParseError>((tnlen, tnoff, challenge, tilen, tioff))
        })();
        let (tnlen, tnoff, challenge, tilen, tioff) = match parsed {
            Ok(f) => f,
            Err(_) => return,
        };
        state.server_challenge = challenge;
        state.target = Self::read_name(state, cur, anchor, tnoff, tnlen);
        if tioff > tnoff {
            cur.seek(anchor + tioff as usize);
            Self::av_pairs(state, cur, tilen);
        }
    }

    fn authenticate(state: &mut NtlmFlow, cur: &mut ByteCursor, anchor: usize) {
        let parsed = (|| {
            let (lmlen, lmoff) = Self::field(cur)?;
            let (ntlen, ntoff) = Self::field(cur)?;
            let (dlen, doff) = Self::field(cur)?;
            let (ulen, uoff) = Self::field(cur)?;
            let (wlen, woff) = Self::field(cur)?;
            let (elen, eoff) = Self::field(cur)?;
            let flags = cur.read_le_u32()?;
            state.nego_flags |= flags;
            if flags & FLAG_NEGOTIATE_VERSION != 0 {
                Self::read_version(state, cur)?;
            }
            Ok::<_, ParseError>((
                (lmlen, lmoff),
                (ntlen, ntoff),
                (dlen, doff),
                (ulen, uoff),
                (wlen, woff),
                (elen, eoff),
            ))
        })();
        let ((lmlen, lmoff), (ntlen, ntoff), (dlen, doff), (ulen, uoff), (wlen, woff), (elen, eoff)) =
            match parsed {
                Ok(f) => f,
                Err(_) => return,
            };

        if ntlen == 24 {
            // NetNTLMv1: the LM and NT responses are the proof material.
            state.auth_type = 1;
            cur.seek(anchor + lmoff as usize);
            if let Ok(hex) = cur.read_hex(lmlen as usize) {
                state.nt_proof = hex;
            }
            cur.seek(anchor + ntoff as usize);
            if let Ok(hex) = cur.read_hex(ntlen as usize) {
                state.client_challenge = hex;
            }
        } else if ntlen > 60 {
            // NetNTLMv2: 16-byte NT proof, then the client blob; AV pairs
            // start 44 bytes into the response.
            state.auth_type = 2;
            cur.seek(anchor + ntoff as usize);
            if let Ok(hex) = cur.read_hex(16) {
                state.nt_proof = hex;
            }
            if let Ok(hex) = cur.read_hex(ntlen as usize - 16) {
                state.client_challenge = hex;
            }
            cur.seek(anchor + ntoff as usize + 44);
            Self::av_pairs(state, cur, ntlen - 44);
        }

        state.domain = Self::read_name(state, cur, anchor, doff, dlen);
        state.user = Self::read_name(state, cur, anchor, uoff, ulen);
        state.workstation = Self::read_name(state, cur, anchor, woff, wlen);
        if elen == 16 {
            cur.seek(anchor + eoff as usize);
            if let Ok(hex) = cur.read_hex(16) {
                state.session_key = hex;
            }
        }
    }

    fn hash_file(&mut self, v2: bool) -> Option<&mut File> {
        let (slot, suffix) = if v2 {
            (&mut self.v2_file, "_NetNTLMv2.txt")
        } else {
            (&mut self.v1_file, "_NetNTLMv1.txt")
        };
        if slot.is_none() {
            let name = format!("{}{}", self.config.file_prefix, suffix);
            let path = self.config.output_dir.join(name);
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match File::create(&path) {
                Ok(f) => *slot = Some(f),
                Err(e) => {
                    warn!("failed to open {}: {e}", path.display());
                    return None;
                }
            }
        }
        slot.as_mut()
    }
}

impl Decoder for NtlmsspDecoder {
    fn name(&self) -> &'static str {
        "ntlmsspDecode"
    }

    fn header(&self) -> Vec<Column> {
        vec![
            Column::new("ntlmsspStat", "NTLMSSP status", ColumnType::Hex8),
            Column::new("ntlmsspNegotiateFlags", "NTLMSSP negotiate flags", ColumnType::Hex32),
            Column::new("ntlmsspTarget", "NTLMSSP target name", ColumnType::Str),
            Column::new("ntlmsspDomain", "NTLMSSP domain name", ColumnType::Str),
            Column::new("ntlmsspUser", "NTLMSSP user name", ColumnType::Str),
            Column::new("ntlmsspWorkstation", "NTLMSSP workstation", ColumnType::Str),
            Column::new("ntlmsspNbComputer", "NTLMSSP NetBIOS computer name", ColumnType::Str),
            Column::new("ntlmsspNbDomain", "NTLMSSP NetBIOS domain name", ColumnType::Str),
            Column::new("ntlmsspDnsComputer", "NTLMSSP DNS computer name", ColumnType::Str),
            Column::new("ntlmsspDnsDomain", "NTLMSSP DNS domain name", ColumnType::Str),
            Column::new("ntlmsspDnsTree", "NTLMSSP DNS tree name", ColumnType::Str),
            Column::new("ntlmsspAttrTarget", "NTLMSSP attribute target name", ColumnType::Str),
            Column::group(
                "ntlmsspVersion_major_minor_build_rev",
                "NTLMSSP version",
                &[
                    ColumnType::U8,
                    ColumnType::U8,
                    ColumnType::U16,
                    ColumnType::U8,
                ],
            ),
            Column::new("ntlmsspServChallenge", "NTLMSSP server challenge", ColumnType::Str),
            Column::new("ntlmsspNTProof", "NTLMSSP NT proof string", ColumnType::Str),
            Column::new("ntlmsspCliChallenge", "NTLMSSP client challenge", ColumnType::Str),
            Column::new("ntlmsspSessKey", "NTLMSSP encrypted session key", ColumnType::Str),
        ]
    }

    fn on_new_flow(&mut self, _packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        self.flows[flow.index.0] = NtlmFlow::default();
    }

    fn on_layer4(&mut self, packet: &Packet, flow: &Flow, _flows: &FlowTable) {
        if !packet.first_fragment {
            return;
        }
        let state = &mut self.flows[flow.index.0];
        let mut cur = ByteCursor::new(packet.l7());
        if !cur.memmem(NTLMSSP_MAGIC) {
            return;
        }
        let anchor = cur.tell();
        state.status |= NTLMSSP_STAT_NTLMSSP;
        self.packets += 1;

        if cur.skip(8).is_err() {
            state.status |= NTLMSSP_STAT_MALFORMED;
            return;
        }
        let msg_type = match cur.read_le_u32() {
            Ok(t) => t,
            Err(_) => {
                state.status |= NTLMSSP_STAT_MALFORMED;
                return;
            }
        };
        match msg_type {
            MSG_NEGOTIATE => {
                state.status |= NTLMSSP_STAT_NEGOTIATE;
                Self::negotiate(state, &mut cur, anchor);
            }
            MSG_CHALLENGE => {
                state.status |= NTLMSSP_STAT_CHALLENGE;
                Self::challenge(state, &mut cur, anchor);
            }
            MSG_AUTHENTICATE => {
                state.status |= NTLMSSP_STAT_AUTHENTICATE;
                Self::authenticate(state, &mut cur, anchor);
            }
            other => {
                debug!("invalid NTLMSSP message type {other:#010x}");
                state.status |= NTLMSSP_STAT_MALFORMED;
            }
        }
    }

    fn on_flow_terminate(
        &mut self,
        flow: &Flow,
        _flows: &FlowTable,
        record: &mut RecordBuilder,
    ) -> Result<()> {
        // Hash extraction needs the client's authenticate material and the
        // server challenge from the opposite direction.
        if self.config.enable_save && !flow.is_b() {
            if let Some(opp) = flow.opposite {
                let server_challenge = self.flows[opp.0].server_challenge.clone();
                let state = &self.flows[flow.index.0];
                if !state.user.is_empty()
                    && !state.domain.is_empty()
                    && !server_challenge.is_empty()
                    && !state.client_challenge.is_empty()
                    && !state.nt_proof.is_empty()
                {
                    let (line, bit) = if state.auth_type == 1 {
                        (
                            format!(
                                "{}::{}:{}:{}:{}\n",
                                state.user,
                                state.domain,
                                state.nt_proof,
                                state.client_challenge,
                                server_challenge
                            ),
                            NTLMSSP_STAT_HASH_V1,
                        )
                    } else {
                        (
                            format!(
                                "{}::{}:{}:{}:{}\n",
                                state.user,
                                state.domain,
                                server_challenge,
                                state.nt_proof,
                                state.client_challenge
                            ),
                            NTLMSSP_STAT_HASH_V2,
                        )
                    };
                    let v2 = bit == NTLMSSP_STAT_HASH_V2;
                    if let Some(file) = self.hash_file(v2) {
                        if file.write_all(line.as_bytes()).is_ok() {
                            self.hashes += 1;
                            self.flows[flow.index.0].status |= bit;
                        }
                    }
                }
            }
        }

        let state = &self.flows[flow.index.0];
        self.agg_status |= state.status;

        record.append_u8(state.status)?;
        record.append_u32(state.nego_flags)?;
        record.append_str(&state.target)?;
        record.append_str(&state.domain)?;
        record.append_str(&state.user)?;
        record.append_str(&state.workstation)?;
        record.append_str(&state.nb_computer)?;
        record.append_str(&state.nb_domain)?;
        record.append_str(&state.dns_computer)?;
        record.append_str(&state.dns_domain)?;
        record.append_str(&state.dns_tree)?;
        record.append_str(&state.attr_target)?;
        record.begin_repeat(1)?;
        record.append_u8(state.version.major)?;
        record.append_u8(state.version.minor)?;
        record.append_u16(state.version.build)?;
        record.append_u8(state.version.revision)?;
        record.append_str(&state.server_challenge)?;
        record.append_str(&state.nt_proof)?;
        record.append_str(&state.client_challenge)?;
        record.append_str(&state.session_key)?;
        Ok(())
    }

    fn report(&self) -> DecoderReport {
        DecoderReport {
            status: u64::from(self.agg_status),
            packets: self.packets,
            units: self.hashes,
        }
    }

    fn finalize(&mut self) {
        self.v1_file = None;
        self.v2_file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, FlowIndex};
    use crate::packet::L4_TCP;

    fn utf16(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    fn field(len: usize, off: usize) -> Vec<u8> {
        let mut out = (len as u16).to_le_bytes().to_vec();
        out.extend_from_slice(&(len as u16).to_le_bytes());
        out.extend_from_slice(&(off as u32).to_le_bytes());
        out
    }

    /// Server challenge message with the given target name.
    fn challenge_msg(challenge: [u8; 8], target: &str) -> Vec<u8> {
        let tname = utf16(target);
        let payload_off = 8 + 4 + 8 + 4 + 8 + 8 + 8; // fixed part, no version
        let mut msg = NTLMSSP_MAGIC.to_vec();
        msg.extend_from_slice(&MSG_CHALLENGE.to_le_bytes());
        msg.extend_from_slice(&field(tname.len(), payload_off));
        msg.extend_from_slice(&0u32.to_le_bytes()); // flags
        msg.extend_from_slice(&challenge);
        msg.extend_from_slice(&0u64.to_le_bytes()); // reserved
        msg.extend_from_slice(&field(0, payload_off + tname.len())); // target info
        msg.extend_from_slice(&tname);
        msg
    }

    /// Authenticate message carrying a NetNTLMv2 response.
    fn authenticate_msg(domain: &str, user: &str, proof: &[u8; 16], blob: &[u8]) -> Vec<u8> {
        let dname = utf16(domain);
        let uname = utf16(user);
        let nt_len = 16 + blob.len();
        let fixed = 8 + 4 + 6 * 8 + 4; // magic, type, six fields, flags
        let nt_off = fixed;
        let d_off = nt_off + nt_len;
        let u_off = d_off + dname.len();
        let mut msg = NTLMSSP_MAGIC.to_vec();
        msg.extend_from_slice(&MSG_AUTHENTICATE.to_le_bytes());
        msg.extend_from_slice(&field(0, fixed)); // LM response
        msg.extend_from_slice(&field(nt_len, nt_off));
        msg.extend_from_slice(&field(dname.len(), d_off));
        msg.extend_from_slice(&field(uname.len(), u_off));
        msg.extend_from_slice(&field(0, u_off + uname.len())); // workstation
        msg.extend_from_slice(&field(0, u_off + uname.len())); // session key
        msg.extend_from_slice(&0u32.to_le_bytes()); // flags
        msg.extend_from_slice(proof);
        msg.extend_from_slice(blob);
        msg.extend_from_slice(&dname);
        msg.extend_from_slice(&uname);
        msg
    }

    fn dispatch(dec: &mut NtlmsspDecoder, flows: &FlowTable, flow: &Flow, payload: &[u8]) {
        let mut raw = vec![0u8; 54];
        raw.extend_from_slice(payload);
        let pkt = Packet::layer4(
            &raw,
            L4_TCP,
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            50000,
            445,
            54,
        );
        dec.on_layer4(&pkt, flow, flows);
    }

    #[test]
    fn challenge_extracts_server_challenge() {
        let mut dec = NtlmsspDecoder::new(1, DecoderConfig::default());
        let flows = FlowTable::with_capacity(1);
        let flow = Flow::new(1, FlowIndex(0), Direction::B);
        let msg = challenge_msg([0x8b, 0x7f, 0x01, 0x02, 0x03, 0x04, 0xe3, 0xa9], "CORP");
        dispatch(&mut dec, &flows, &flow, &msg);

        let state = &dec.flows[0];
        assert!(state.status & NTLMSSP_STAT_CHALLENGE != 0);
        assert_eq!(state.server_challenge, "8b7f01020304e3a9");
        assert_eq!(state.target, "CORP");
    }

    #[test]
    fn authenticate_extracts_proof_and_names() {
        let mut dec = NtlmsspDecoder::new(1, DecoderConfig::default());
        let flows = FlowTable::with_capacity(1);
        let flow = Flow::new(1, FlowIndex(0), Direction::A);
        let proof = [0xaa; 16];
        let blob = vec![0xbb; 46];
        let msg = authenticate_msg("CORP", "alice", &proof, &blob);
        dispatch(&mut dec, &flows, &flow, &msg);

        let state = &dec.flows[0];
        assert!(state.status & NTLMSSP_STAT_AUTHENTICATE != 0);
        assert_eq!(state.auth_type, 2);
        assert_eq!(state.domain, "CORP");
        assert_eq!(state.user, "alice");
        assert_eq!(state.nt_proof, "aa".repeat(16));
        assert_eq!(state.client_challenge, "bb".repeat(46));
    }

    #[test]
    fn hash_line_written_on_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let config = DecoderConfig {
            enable_save: true,
            output_dir: dir.path().to_path_buf(),
            ..DecoderConfig::default()
        };
        let mut dec = NtlmsspDecoder::new(2, config);
        let mut flows = FlowTable::with_capacity(2);
        let mut a = Flow::new(1, FlowIndex(0), Direction::A);
        a.opposite = Some(FlowIndex(1));
        let mut b = Flow::new(2, FlowIndex(1), Direction::B);
        b.opposite = Some(FlowIndex(0));

        let challenge = challenge_msg([0x8b, 0x7f, 0, 0, 0, 0, 0xe3, 0xa9], "CORP");
        dispatch(&mut dec, &flows, &b, &challenge);
        let proof = [0xaa; 16];
        let blob = vec![0xbb; 46];
        let auth = authenticate_msg("CORP", "alice", &proof, &blob);
        dispatch(&mut dec, &flows, &a, &auth);

        flows.insert(a.clone());
        flows.insert(b);
        let columns = dec.header();
        let mut record = RecordBuilder::new(&columns);
        dec.on_flow_terminate(&a, &flows, &mut record).unwrap();
        record.finish().unwrap();

        let content = std::fs::read_to_string(dir.path().join("_NetNTLMv2.txt")).unwrap();
        let expected = format!(
            "alice::CORP:8b7f00000000e3a9:{}:{}\n",
            "aa".repeat(16),
            "bb".repeat(46)
        );
        assert_eq!(content, expected);
        assert!(dec.flows[0].status & NTLMSSP_STAT_HASH_V2 != 0);
    }

    #[test]
    fn non_ntlmssp_payload_is_ignored() {
        let mut dec = NtlmsspDecoder::new(1, DecoderConfig::default());
        let flows = FlowTable::with_capacity(1);
        let flow = Flow::new(1, FlowIndex(0), Direction::A);
        dispatch(&mut dec, &flows, &flow, b"plain old data");
        assert_eq!(dec.flows[0].status, 0);
    }
}
