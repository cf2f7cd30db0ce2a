//! Protocol Wire Formats
//!
//! Hand-rolled big-endian codecs for every structure that crosses the
//! protocol boundary or lands in storage. Length prefixes: u8 for short
//! identifiers (labels), u16 for signatures and element counts, u32 for
//! label values. Optional fields encode as 0x00 or 0x01 followed by the
//! body. Decoders reject trailing bytes at the top level.

use thiserror::Error;

use crate::crypto::{Hash, HASH_SIZE};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("trailing bytes after message")]
    TrailingBytes,

    #[error("invalid tag byte: {0}")]
    InvalidTag(u8),

    #[error("length prefix overflows field: {0}")]
    LengthOverflow(usize),

    #[error("varint does not terminate")]
    VarintOverflow,

    #[error("stored index is not strictly monotone")]
    NonMonotonicIndex,

    #[error("unknown cipher suite id: {0}")]
    UnknownSuite(u16),

    #[error("unknown deployment mode: {0}")]
    UnknownMode(u8),
}

// ============================================================================
// Encoder / Decoder
// ============================================================================

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub fn bytes_u8(&mut self, v: &[u8]) {
        assert!(v.len() <= u8::MAX as usize, "u8-prefixed field too long");
        self.u8(v.len() as u8);
        self.bytes(v);
    }

    pub fn bytes_u16(&mut self, v: &[u8]) {
        assert!(v.len() <= u16::MAX as usize, "u16-prefixed field too long");
        self.u16(v.len() as u16);
        self.bytes(v);
    }

    pub fn bytes_u32(&mut self, v: &[u8]) {
        assert!(v.len() <= u32::MAX as usize, "u32-prefixed field too long");
        self.u32(v.len() as u32);
        self.bytes(v);
    }

    pub fn optional<T, F: FnOnce(&mut Self, &T)>(&mut self, v: &Option<T>, f: F) {
        match v {
            None => self.u8(0),
            Some(inner) => {
                self.u8(1);
                f(self, inner);
            }
        }
    }

    /// Base-128 varint, most significant group first.
    pub fn uvarint(&mut self, mut v: u64) {
        let mut groups = [0u8; 10];
        let mut n = 0;
        loop {
            groups[n] = (v & 0x7f) as u8;
            v >>= 7;
            n += 1;
            if v == 0 {
                break;
            }
        }
        for i in (0..n).rev() {
            let cont = if i == 0 { 0 } else { 0x80 };
            self.buf.push(groups[i] | cont);
        }
    }
}

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn finish(self) -> Result<(), WireError> {
        if self.remaining() != 0 {
            return Err(WireError::TrailingBytes);
        }
        Ok(())
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::UnexpectedEnd);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn hash(&mut self) -> Result<Hash, WireError> {
        Ok(self.take(HASH_SIZE)?.try_into().unwrap())
    }

    pub fn bytes_u8(&mut self) -> Result<Vec<u8>, WireError> {
        let n = self.u8()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    pub fn bytes_u16(&mut self) -> Result<Vec<u8>, WireError> {
        let n = self.u16()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    pub fn bytes_u32(&mut self) -> Result<Vec<u8>, WireError> {
        let n = self.u32()? as usize;
        Ok(self.take(n)?.to_vec())
    }

    pub fn optional<T, F: FnOnce(&mut Self) -> Result<T, WireError>>(
        &mut self,
        f: F,
    ) -> Result<Option<T>, WireError> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(f(self)?)),
            other => Err(WireError::InvalidTag(other)),
        }
    }

    pub fn uvarint(&mut self) -> Result<u64, WireError> {
        let mut out: u64 = 0;
        for _ in 0..10 {
            let b = self.u8()?;
            if out > u64::MAX >> 7 {
                return Err(WireError::VarintOverflow);
            }
            out = (out << 7)
                .checked_add((b & 0x7f) as u64)
                .ok_or(WireError::VarintOverflow)?;
            if b & 0x80 == 0 {
                return Ok(out);
            }
        }
        Err(WireError::VarintOverflow)
    }
}

// ============================================================================
// Deployment modes and public configuration
// ============================================================================

/// How the deployment distributes trust beyond the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Users monitor their own labels.
    ContactMonitoring,
    /// A third-party operator countersigns every update value.
    ThirdPartyManagement { operator_public_key: Vec<u8> },
    /// A third-party auditor countersigns tree heads.
    ThirdPartyAuditing { auditor_public_key: Vec<u8> },
}

impl DeploymentMode {
    pub fn tag(&self) -> u8 {
        match self {
            DeploymentMode::ContactMonitoring => 1,
            DeploymentMode::ThirdPartyManagement { .. } => 2,
            DeploymentMode::ThirdPartyAuditing { .. } => 3,
        }
    }
}

/// The public parameters every client of a deployment shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicConfig {
    pub suite_id: u16,
    pub mode: DeploymentMode,
    pub signature_public_key: Vec<u8>,
    pub vrf_public_key: Vec<u8>,
    /// Tolerated clock skew ahead of local time, milliseconds.
    pub max_ahead: u64,
    /// Tolerated staleness behind local time, milliseconds.
    pub max_behind: u64,
    /// Reasonable monitoring window, milliseconds.
    pub reasonable_monitoring_window: u64,
    /// Maximum entry lifetime, milliseconds. None disables expiry.
    pub maximum_lifetime: Option<u64>,
}

impl PublicConfig {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.u16(self.suite_id);
        enc.u8(self.mode.tag());
        enc.bytes_u16(&self.signature_public_key);
        enc.bytes_u16(&self.vrf_public_key);
        match &self.mode {
            DeploymentMode::ContactMonitoring => {}
            DeploymentMode::ThirdPartyManagement { operator_public_key } => {
                enc.bytes_u16(operator_public_key)
            }
            DeploymentMode::ThirdPartyAuditing { auditor_public_key } => {
                enc.bytes_u16(auditor_public_key)
            }
        }
        enc.u64(self.max_ahead);
        enc.u64(self.max_behind);
        enc.u64(self.reasonable_monitoring_window);
        enc.optional(&self.maximum_lifetime, |e, v| e.u64(*v));
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut dec = Decoder::new(buf);
        let out = Self::read(&mut dec)?;
        dec.finish()?;
        Ok(out)
    }

    pub fn read(dec: &mut Decoder) -> Result<Self, WireError> {
        let suite_id = dec.u16()?;
        let mode_tag = dec.u8()?;
        let signature_public_key = dec.bytes_u16()?;
        let vrf_public_key = dec.bytes_u16()?;
        let mode = match mode_tag {
            1 => DeploymentMode::ContactMonitoring,
            2 => DeploymentMode::ThirdPartyManagement {
                operator_public_key: dec.bytes_u16()?,
            },
            3 => DeploymentMode::ThirdPartyAuditing {
                auditor_public_key: dec.bytes_u16()?,
            },
            other => return Err(WireError::UnknownMode(other)),
        };
        Ok(Self {
            suite_id,
            mode,
            signature_public_key,
            vrf_public_key,
            max_ahead: dec.u64()?,
            max_behind: dec.u64()?,
            reasonable_monitoring_window: dec.u64()?,
            maximum_lifetime: dec.optional(|d| d.u64())?,
        })
    }
}

// ============================================================================
// Log entries, label values, indexes
// ============================================================================

/// One appended log entry: when it happened and the prefix tree it pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: u64,
    pub prefix_root: Hash,
}

impl LogEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.u64(self.timestamp);
        enc.bytes(&self.prefix_root);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut dec = Decoder::new(buf);
        let out = Self {
            timestamp: dec.u64()?,
            prefix_root: dec.hash()?,
        };
        dec.finish()?;
        Ok(out)
    }
}

/// The opaque payload bound to a label version, optionally countersigned by
/// a third-party operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateValue {
    pub prefix: Option<Vec<u8>>,
    pub value: Vec<u8>,
}

impl UpdateValue {
    pub fn write(&self, enc: &mut Encoder) {
        enc.optional(&self.prefix, |e, sig| e.bytes_u16(sig));
        enc.bytes_u32(&self.value);
    }

    pub fn read(dec: &mut Decoder) -> Result<Self, WireError> {
        Ok(Self {
            prefix: dec.optional(|d| d.bytes_u16())?,
            value: dec.bytes_u32()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.write(&mut enc);
        enc.finish()
    }
}

/// Body of a commitment: the label plus its update value.
pub fn commitment_value(label: &[u8], update: &UpdateValue) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.bytes_u8(label);
    update.write(&mut enc);
    enc.finish()
}

/// To-be-signed bytes of an update value for third-party-management
/// deployments: the label and the raw value, excluding the signature
/// prefix itself.
pub fn update_value_tbs(label: &[u8], update: &UpdateValue) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.bytes_u8(label);
    enc.bytes_u32(&update.value);
    enc.finish()
}

/// VRF input for one version of a label.
pub fn vrf_input(label: &[u8], version: u32) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.bytes_u8(label);
    enc.u32(version);
    enc.finish()
}

/// Stored record for one (label, version): the opening then the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelValue {
    pub opening: Vec<u8>,
    pub update: UpdateValue,
}

impl LabelValue {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.bytes(&self.opening);
        self.update.write(&mut enc);
        enc.finish()
    }

    pub fn decode(buf: &[u8], opening_size: usize) -> Result<Self, WireError> {
        let mut dec = Decoder::new(buf);
        let opening = dec.take(opening_size)?.to_vec();
        let update = UpdateValue::read(&mut dec)?;
        dec.finish()?;
        Ok(Self { opening, update })
    }
}

/// Encode a label's index (log positions of its versions) as varint deltas.
/// Positions must be non-decreasing; several versions added by one
/// mutation share a log position, encoded as a zero delta.
pub fn encode_index(positions: &[u64]) -> Result<Vec<u8>, WireError> {
    let mut enc = Encoder::new();
    let mut prev: Option<u64> = None;
    for &pos in positions {
        match prev {
            None => enc.uvarint(pos),
            Some(p) if pos >= p => enc.uvarint(pos - p),
            Some(_) => return Err(WireError::NonMonotonicIndex),
        }
        prev = Some(pos);
    }
    Ok(enc.finish())
}

/// Decode a varint-delta index back into absolute log positions.
pub fn decode_index(buf: &[u8]) -> Result<Vec<u64>, WireError> {
    let mut dec = Decoder::new(buf);
    let mut out: Vec<u64> = Vec::new();
    while dec.remaining() > 0 {
        let delta = dec.uvarint()?;
        match out.last().copied() {
            None => out.push(delta),
            Some(prev) => out.push(
                prev.checked_add(delta)
                    .ok_or(WireError::VarintOverflow)?,
            ),
        }
    }
    Ok(out)
}

// ============================================================================
// Tree heads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeHead {
    pub tree_size: u64,
    pub signature: Vec<u8>,
}

impl TreeHead {
    pub fn write(&self, enc: &mut Encoder) {
        enc.u64(self.tree_size);
        enc.bytes_u16(&self.signature);
    }

    pub fn read(dec: &mut Decoder) -> Result<Self, WireError> {
        Ok(Self {
            tree_size: dec.u64()?,
            signature: dec.bytes_u16()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.write(&mut enc);
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut dec = Decoder::new(buf);
        let out = Self::read(&mut dec)?;
        dec.finish()?;
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditorTreeHead {
    pub timestamp: u64,
    pub tree_size: u64,
    pub signature: Vec<u8>,
}

impl AuditorTreeHead {
    pub fn write(&self, enc: &mut Encoder) {
        enc.u64(self.timestamp);
        enc.u64(self.tree_size);
        enc.bytes_u16(&self.signature);
    }

    pub fn read(dec: &mut Decoder) -> Result<Self, WireError> {
        Ok(Self {
            timestamp: dec.u64()?,
            tree_size: dec.u64()?,
            signature: dec.bytes_u16()?,
        })
    }
}

/// To-be-signed encoding of a tree head.
pub fn tree_head_tbs(config: &PublicConfig, tree_size: u64, root: &Hash) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.bytes(&config.encode());
    enc.u64(tree_size);
    enc.bytes(root);
    enc.finish()
}

/// To-be-signed encoding of an auditor tree head.
pub fn auditor_tree_head_tbs(
    config: &PublicConfig,
    timestamp: u64,
    tree_size: u64,
    root: &Hash,
) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.bytes(&config.encode());
    enc.u64(timestamp);
    enc.u64(tree_size);
    enc.bytes(root);
    enc.finish()
}

/// Tree head material attached to a response. `Same` means the head the
/// client already holds is still current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FullTreeHead {
    Same,
    Updated {
        tree_head: TreeHead,
        auditor: Option<AuditorTreeHead>,
    },
}

impl FullTreeHead {
    pub fn write(&self, enc: &mut Encoder) {
        match self {
            FullTreeHead::Same => enc.u8(1),
            FullTreeHead::Updated { tree_head, auditor } => {
                enc.u8(2);
                tree_head.write(enc);
                if let Some(head) = auditor {
                    head.write(enc);
                }
            }
        }
    }

    /// Reading needs the deployment mode: only auditing deployments carry an
    /// auditor head.
    pub fn read(dec: &mut Decoder, mode: &DeploymentMode) -> Result<Self, WireError> {
        match dec.u8()? {
            1 => Ok(FullTreeHead::Same),
            2 => {
                let tree_head = TreeHead::read(dec)?;
                let auditor = match mode {
                    DeploymentMode::ThirdPartyAuditing { .. } => {
                        Some(AuditorTreeHead::read(dec)?)
                    }
                    _ => None,
                };
                Ok(FullTreeHead::Updated { tree_head, auditor })
            }
            other => Err(WireError::InvalidTag(other)),
        }
    }
}

// ============================================================================
// Prefix proofs
// ============================================================================

/// Outcome of one prefix-tree lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixSearchResult {
    /// Terminated at a leaf holding the searched VRF output.
    Inclusion { depth: u8 },
    /// Terminated at a leaf holding a different VRF output.
    NonInclusionLeaf {
        vrf_output: [u8; 32],
        commitment: Hash,
        depth: u8,
    },
    /// Terminated at an empty subtree.
    NonInclusionParent { depth: u8 },
}

impl PrefixSearchResult {
    pub fn depth(&self) -> u8 {
        match self {
            PrefixSearchResult::Inclusion { depth }
            | PrefixSearchResult::NonInclusionLeaf { depth, .. }
            | PrefixSearchResult::NonInclusionParent { depth } => *depth,
        }
    }

    pub fn is_inclusion(&self) -> bool {
        matches!(self, PrefixSearchResult::Inclusion { .. })
    }

    pub fn write(&self, enc: &mut Encoder) {
        match self {
            PrefixSearchResult::Inclusion { depth } => {
                enc.u8(0);
                enc.u8(*depth);
            }
            PrefixSearchResult::NonInclusionLeaf {
                vrf_output,
                commitment,
                depth,
            } => {
                enc.u8(1);
                enc.bytes(vrf_output);
                enc.bytes(commitment);
                enc.u8(*depth);
            }
            PrefixSearchResult::NonInclusionParent { depth } => {
                enc.u8(2);
                enc.u8(*depth);
            }
        }
    }

    pub fn read(dec: &mut Decoder) -> Result<Self, WireError> {
        match dec.u8()? {
            0 => Ok(PrefixSearchResult::Inclusion { depth: dec.u8()? }),
            1 => Ok(PrefixSearchResult::NonInclusionLeaf {
                vrf_output: dec.hash()?,
                commitment: dec.hash()?,
                depth: dec.u8()?,
            }),
            2 => Ok(PrefixSearchResult::NonInclusionParent { depth: dec.u8()? }),
            other => Err(WireError::InvalidTag(other)),
        }
    }
}

/// Batched (non-)inclusion proof against one prefix root.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PrefixProof {
    pub results: Vec<PrefixSearchResult>,
    pub elements: Vec<Hash>,
}

impl PrefixProof {
    pub fn write(&self, enc: &mut Encoder) {
        assert!(self.results.len() <= u8::MAX as usize, "too many results");
        enc.u8(self.results.len() as u8);
        for r in &self.results {
            r.write(enc);
        }
        assert!(self.elements.len() <= u16::MAX as usize, "too many elements");
        enc.u16(self.elements.len() as u16);
        for e in &self.elements {
            enc.bytes(e);
        }
    }

    pub fn read(dec: &mut Decoder) -> Result<Self, WireError> {
        let n = dec.u8()? as usize;
        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            results.push(PrefixSearchResult::read(dec)?);
        }
        let m = dec.u16()? as usize;
        let mut elements = Vec::with_capacity(m);
        for _ in 0..m {
            elements.push(dec.hash()?);
        }
        Ok(Self { results, elements })
    }
}

// ============================================================================
// Combined tree proof
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InclusionProof {
    pub elements: Vec<Hash>,
}

impl InclusionProof {
    pub fn write(&self, enc: &mut Encoder) {
        assert!(self.elements.len() <= u16::MAX as usize, "too many elements");
        enc.u16(self.elements.len() as u16);
        for e in &self.elements {
            enc.bytes(e);
        }
    }

    pub fn read(dec: &mut Decoder) -> Result<Self, WireError> {
        let n = dec.u16()? as usize;
        let mut elements = Vec::with_capacity(n);
        for _ in 0..n {
            elements.push(dec.hash()?);
        }
        Ok(Self { elements })
    }
}

/// Everything a search or monitoring pass produced, in inspection order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CombinedTreeProof {
    pub timestamps: Vec<u64>,
    pub prefix_proofs: Vec<PrefixProof>,
    pub prefix_roots: Vec<Hash>,
    pub inclusion: InclusionProof,
}

impl CombinedTreeProof {
    pub fn write(&self, enc: &mut Encoder) {
        assert!(self.timestamps.len() <= u8::MAX as usize, "too many timestamps");
        enc.u8(self.timestamps.len() as u8);
        for ts in &self.timestamps {
            enc.u64(*ts);
        }
        assert!(self.prefix_proofs.len() <= u8::MAX as usize, "too many proofs");
        enc.u8(self.prefix_proofs.len() as u8);
        for p in &self.prefix_proofs {
            p.write(enc);
        }
        assert!(self.prefix_roots.len() <= u8::MAX as usize, "too many roots");
        enc.u8(self.prefix_roots.len() as u8);
        for r in &self.prefix_roots {
            enc.bytes(r);
        }
        self.inclusion.write(enc);
    }

    pub fn read(dec: &mut Decoder) -> Result<Self, WireError> {
        let n = dec.u8()? as usize;
        let mut timestamps = Vec::with_capacity(n);
        for _ in 0..n {
            timestamps.push(dec.u64()?);
        }
        let n = dec.u8()? as usize;
        let mut prefix_proofs = Vec::with_capacity(n);
        for _ in 0..n {
            prefix_proofs.push(PrefixProof::read(dec)?);
        }
        let n = dec.u8()? as usize;
        let mut prefix_roots = Vec::with_capacity(n);
        for _ in 0..n {
            prefix_roots.push(dec.hash()?);
        }
        Ok(Self {
            timestamps,
            prefix_proofs,
            prefix_roots,
            inclusion: InclusionProof::read(dec)?,
        })
    }
}

// ============================================================================
// Search request / response
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// The tree size the client last saw, if any.
    pub last: Option<u64>,
    pub label: Vec<u8>,
    /// Explicit version; None asks for the greatest.
    pub version: Option<u32>,
}

impl SearchRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.optional(&self.last, |e, v| e.u64(*v));
        enc.bytes_u8(&self.label);
        enc.optional(&self.version, |e, v| e.u32(*v));
        enc.finish()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut dec = Decoder::new(buf);
        let out = Self {
            last: dec.optional(|d| d.u64())?,
            label: dec.bytes_u8()?,
            version: dec.optional(|d| d.u32())?,
        };
        dec.finish()?;
        Ok(out)
    }
}

/// One rung of a binary ladder: the VRF proof for a version, plus the
/// commitment found there unless the version is the search target (the
/// target's commitment is recomputed from the returned opening and value).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryLadderStep {
    pub vrf_proof: Vec<u8>,
    pub commitment: Option<Hash>,
}

impl BinaryLadderStep {
    pub fn write(&self, enc: &mut Encoder) {
        enc.bytes(&self.vrf_proof);
        enc.optional(&self.commitment, |e, c| e.bytes(c));
    }

    pub fn read(dec: &mut Decoder, vrf_proof_size: usize) -> Result<Self, WireError> {
        Ok(Self {
            vrf_proof: dec.take(vrf_proof_size)?.to_vec(),
            commitment: dec.optional(|d| d.hash())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub full_tree_head: FullTreeHead,
    /// Echoed resolved version when the request asked for the greatest.
    pub version: Option<u32>,
    pub opening: Vec<u8>,
    pub value: UpdateValue,
    pub ladder: Vec<BinaryLadderStep>,
    pub proof: CombinedTreeProof,
}

impl SearchResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.full_tree_head.write(&mut enc);
        enc.optional(&self.version, |e, v| e.u32(*v));
        enc.bytes(&self.opening);
        self.value.write(&mut enc);
        assert!(self.ladder.len() <= u8::MAX as usize, "ladder too long");
        enc.u8(self.ladder.len() as u8);
        for step in &self.ladder {
            step.write(&mut enc);
        }
        self.proof.write(&mut enc);
        enc.finish()
    }

    pub fn decode(
        buf: &[u8],
        mode: &DeploymentMode,
        opening_size: usize,
        vrf_proof_size: usize,
    ) -> Result<Self, WireError> {
        let mut dec = Decoder::new(buf);
        let full_tree_head = FullTreeHead::read(&mut dec, mode)?;
        let version = dec.optional(|d| d.u32())?;
        let opening = dec.take(opening_size)?.to_vec();
        let value = UpdateValue::read(&mut dec)?;
        let n = dec.u8()? as usize;
        let mut ladder = Vec::with_capacity(n);
        for _ in 0..n {
            ladder.push(BinaryLadderStep::read(&mut dec, vrf_proof_size)?);
        }
        let proof = CombinedTreeProof::read(&mut dec)?;
        dec.finish()?;
        Ok(Self {
            full_tree_head,
            version,
            opening,
            value,
            ladder,
            proof,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> PublicConfig {
        PublicConfig {
            suite_id: 1,
            mode: DeploymentMode::ContactMonitoring,
            signature_public_key: vec![1u8; 32],
            vrf_public_key: vec![2u8; 32],
            max_ahead: 1_000,
            max_behind: 60_000,
            reasonable_monitoring_window: 86_400_000,
            maximum_lifetime: Some(100 * 86_400_000),
        }
    }

    #[test]
    fn test_uvarint_roundtrip() {
        let values = [0u64, 1, 127, 128, 300, 16_383, 16_384, u64::MAX];
        for v in values {
            let mut enc = Encoder::new();
            enc.uvarint(v);
            let bytes = enc.finish();
            let mut dec = Decoder::new(&bytes);
            assert_eq!(dec.uvarint().unwrap(), v);
            dec.finish().unwrap();
        }
    }

    #[test]
    fn test_index_roundtrip() {
        let positions = vec![3u64, 10, 11, 5000];
        let encoded = encode_index(&positions).unwrap();
        assert_eq!(decode_index(&encoded).unwrap(), positions);

        // Versions added by one mutation share a position.
        let positions = vec![0u64, 0, 4];
        let encoded = encode_index(&positions).unwrap();
        assert_eq!(decode_index(&encoded).unwrap(), positions);
    }

    #[test]
    fn test_index_rejects_non_monotone() {
        assert_eq!(encode_index(&[9, 3]), Err(WireError::NonMonotonicIndex));
    }

    #[test]
    fn test_log_entry_roundtrip() {
        let entry = LogEntry {
            timestamp: 1_700_000_000_000,
            prefix_root: [7u8; 32],
        };
        assert_eq!(LogEntry::decode(&entry.encode()).unwrap(), entry);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = sample_config();
        assert_eq!(PublicConfig::decode(&config.encode()).unwrap(), config);

        let auditing = PublicConfig {
            mode: DeploymentMode::ThirdPartyAuditing {
                auditor_public_key: vec![9u8; 32],
            },
            maximum_lifetime: None,
            ..config
        };
        assert_eq!(PublicConfig::decode(&auditing.encode()).unwrap(), auditing);
    }

    #[test]
    fn test_search_request_roundtrip() {
        let req = SearchRequest {
            last: Some(512),
            label: b"alice@example.com".to_vec(),
            version: None,
        };
        assert_eq!(SearchRequest::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn test_search_response_roundtrip() {
        let res = SearchResponse {
            full_tree_head: FullTreeHead::Updated {
                tree_head: TreeHead {
                    tree_size: 42,
                    signature: vec![3u8; 64],
                },
                auditor: None,
            },
            version: Some(7),
            opening: vec![5u8; 16],
            value: UpdateValue {
                prefix: None,
                value: b"public key bytes".to_vec(),
            },
            ladder: vec![BinaryLadderStep {
                vrf_proof: vec![8u8; 80],
                commitment: Some([9u8; 32]),
            }],
            proof: CombinedTreeProof {
                timestamps: vec![1, 2, 3],
                prefix_proofs: vec![PrefixProof {
                    results: vec![
                        PrefixSearchResult::Inclusion { depth: 4 },
                        PrefixSearchResult::NonInclusionParent { depth: 2 },
                    ],
                    elements: vec![[1u8; 32], [2u8; 32]],
                }],
                prefix_roots: vec![[6u8; 32]],
                inclusion: InclusionProof {
                    elements: vec![[4u8; 32]],
                },
            },
        };
        let decoded = SearchResponse::decode(
            &res.encode(),
            &DeploymentMode::ContactMonitoring,
            16,
            80,
        )
        .unwrap();
        assert_eq!(decoded, res);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample_config().encode();
        bytes.push(0);
        assert_eq!(PublicConfig::decode(&bytes), Err(WireError::TrailingBytes));
    }

    #[test]
    fn test_label_value_roundtrip() {
        let lv = LabelValue {
            opening: vec![1u8; 16],
            update: UpdateValue {
                prefix: Some(vec![2u8; 64]),
                value: b"v1".to_vec(),
            },
        };
        assert_eq!(LabelValue::decode(&lv.encode(), 16).unwrap(), lv);
    }
}
