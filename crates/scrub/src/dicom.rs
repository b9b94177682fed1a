use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tracing::debug;

use crate::{ScrubError, ScrubOutcome, Scrubber};

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";
const META_GROUP: u16 = 0x0002;
const UNDEFINED_LENGTH: u32 = 0xFFFF_FFFF;
/// Sequences nested deeper than this are treated as malformed.
const MAX_SEQUENCE_DEPTH: usize = 64;

const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
const EXPLICIT_VR_BE: &str = "1.2.840.10008.1.2.2";
const DEFLATED_EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1.99";

const TRANSFER_SYNTAX: Tag = Tag::new(0x0002, 0x0010);
const ITEM: Tag = Tag::new(0xFFFE, 0xE000);
const ITEM_DELIMITATION: Tag = Tag::new(0xFFFE, 0xE00D);
const SEQUENCE_DELIMITATION: Tag = Tag::new(0xFFFE, 0xE0DD);

/// VRs encoded with a 2-byte reserved field and a 4-byte length.
const LONG_VRS: [&[u8; 2]; 13] = [
    b"OB", b"OD", b"OF", b"OL", b"OV", b"OW", b"SQ", b"UC", b"UN", b"UR", b"UT", b"SV", b"UV",
];

const KNOWN_TAGS: &[(&str, Tag)] = &[
    ("InstitutionName", Tag::new(0x0008, 0x0080)),
    ("ReferringPhysicianName", Tag::new(0x0008, 0x0090)),
    ("PatientName", Tag::new(0x0010, 0x0010)),
    ("PatientID", Tag::new(0x0010, 0x0020)),
    ("PatientBirthDate", Tag::new(0x0010, 0x0030)),
    ("PatientBirthTime", Tag::new(0x0010, 0x0032)),
    ("PatientSex", Tag::new(0x0010, 0x0040)),
    ("OtherPatientIDs", Tag::new(0x0010, 0x1000)),
    ("PatientAddress", Tag::new(0x0010, 0x1040)),
    ("PatientTelephoneNumbers", Tag::new(0x0010, 0x2154)),
];

/// A DICOM attribute tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag {
    pub group: u16,
    pub element: u16,
}

impl Tag {
    pub const fn new(group: u16, element: u16) -> Self {
        Self { group, element }
    }

    /// Resolves a keyword such as `PatientName`, or a hex form such as
    /// `00100010` / `(0010,0010)`.
    pub fn parse(name: &str) -> Result<Self, ScrubError> {
        if let Some((_, tag)) = KNOWN_TAGS.iter().find(|(n, _)| *n == name) {
            return Ok(*tag);
        }
        let hex: String = name
            .chars()
            .filter(|c| !matches!(c, '(' | ')' | ','))
            .collect();
        if hex.len() == 8 && hex.is_ascii() {
            if let (Ok(group), Ok(element)) = (
                u16::from_str_radix(&hex[..4], 16),
                u16::from_str_radix(&hex[4..], 16),
            ) {
                return Ok(Tag::new(group, element));
            }
        }
        Err(ScrubError::UnknownTag(name.to_string()))
    }

    fn is_group_length(&self) -> bool {
        self.element == 0x0000
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:04X},{:04X})", self.group, self.element)
    }
}

/// Blanks configured attributes of DICOM Part-10 files.
///
/// Handles explicit and implicit VR little endian data sets. Only top-level
/// attributes are cleared; sequences are copied through untouched. Blanked
/// attributes keep their tag with a zero-length value and the enclosing
/// group length is adjusted.
#[derive(Debug, Clone)]
pub struct DicomScrubber {
    tags: BTreeSet<Tag>,
}

impl Default for DicomScrubber {
    /// Clears `PatientName` and `PatientBirthDate`.
    fn default() -> Self {
        Self::new([Tag::new(0x0010, 0x0010), Tag::new(0x0010, 0x0030)])
    }
}

impl DicomScrubber {
    pub fn new(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self {
            tags: tags.into_iter().collect(),
        }
    }

    /// Builds a scrubber from tag keywords or hex tags.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, ScrubError> {
        let tags = names
            .iter()
            .map(|n| Tag::parse(n.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(tags))
    }

    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter()
    }

    fn rewrite(&self, data: &[u8]) -> Result<Vec<u8>, ScrubError> {
        let (mut pos, syntax) = read_meta(data)?;
        let explicit = match syntax.as_str() {
            IMPLICIT_VR_LE => false,
            EXPLICIT_VR_BE | DEFLATED_EXPLICIT_VR_LE => {
                return Err(ScrubError::UnsupportedTransferSyntax(syntax));
            }
            // Every other syntax encodes the data set as explicit VR LE.
            _ => true,
        };

        let mut out = Vec::with_capacity(data.len());
        out.extend_from_slice(&data[..pos]);

        let last_target = self.tags.last().copied();
        let mut group_lengths: Vec<(u16, usize)> = Vec::new();
        let mut removed: HashMap<u16, u32> = HashMap::new();

        while pos < data.len() {
            let header = read_header(data, pos, explicit)?;
            if last_target.is_none_or(|last| header.tag > last) {
                break;
            }
            let end = element_end(data, pos, &header, explicit)?;

            if self.tags.contains(&header.tag) && header.length != UNDEFINED_LENGTH {
                out.extend_from_slice(&data[pos..pos + header.header_len]);
                let n = out.len();
                out[n - header.length_width..].fill(0);
                *removed.entry(header.tag.group).or_default() += header.length;
                debug!(tag = %header.tag, bytes = header.length, "blanked attribute");
            } else {
                if header.tag.is_group_length() && header.length == 4 {
                    group_lengths.push((header.tag.group, out.len() + header.header_len));
                }
                out.extend_from_slice(&data[pos..end]);
            }
            pos = end;
        }
        out.extend_from_slice(&data[pos..]);

        for (group, at) in group_lengths {
            if let Some(delta) = removed.get(&group) {
                let value = read_u32(&out, at)?;
                out[at..at + 4].copy_from_slice(&value.saturating_sub(*delta).to_le_bytes());
            }
        }
        Ok(out)
    }
}

impl Scrubber for DicomScrubber {
    fn name(&self) -> &'static str {
        "dicom"
    }

    fn scrub(&self, data: &[u8]) -> ScrubOutcome {
        if !is_part10(data) {
            return ScrubOutcome::Unrecognized;
        }
        match self.rewrite(data) {
            Ok(out) => ScrubOutcome::Recognized(out),
            Err(e) => ScrubOutcome::Malformed(e.to_string()),
        }
    }
}

/// Returns `true` when `data` carries the Part-10 preamble and magic.
pub fn is_part10(data: &[u8]) -> bool {
    data.len() >= PREAMBLE_LEN + MAGIC.len() && &data[PREAMBLE_LEN..PREAMBLE_LEN + 4] == MAGIC
}

// ---------------------------------------------------------------------------
// Element parsing
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Header {
    tag: Tag,
    vr: Option<[u8; 2]>,
    length: u32,
    header_len: usize,
    /// Size of the length field at the end of the header.
    length_width: usize,
}

/// Walks the file meta group, returning the data set offset and the
/// transfer syntax UID.
fn read_meta(data: &[u8]) -> Result<(usize, String), ScrubError> {
    let mut pos = PREAMBLE_LEN + MAGIC.len();
    let mut syntax = None;
    while pos + 2 <= data.len() && read_u16(data, pos)? == META_GROUP {
        let header = read_header(data, pos, true)?;
        let start = pos + header.header_len;
        let end = checked_end(data, start, header.length)?;
        if header.tag == TRANSFER_SYNTAX {
            let uid = String::from_utf8_lossy(&data[start..end]);
            syntax = Some(uid.trim_end_matches(['\0', ' ']).to_string());
        }
        pos = end;
    }
    syntax
        .map(|s| (pos, s))
        .ok_or(ScrubError::MissingTransferSyntax)
}

fn read_header(data: &[u8], pos: usize, explicit: bool) -> Result<Header, ScrubError> {
    let tag = Tag::new(read_u16(data, pos)?, read_u16(data, pos + 2)?);

    // Items and delimiters never carry a VR.
    if tag.group == 0xFFFE || !explicit {
        return Ok(Header {
            tag,
            vr: None,
            length: read_u32(data, pos + 4)?,
            header_len: 8,
            length_width: 4,
        });
    }

    let vr_bytes = data
        .get(pos + 4..pos + 6)
        .ok_or(ScrubError::Truncated { offset: pos })?;
    let vr = [vr_bytes[0], vr_bytes[1]];
    if !vr.iter().all(u8::is_ascii_uppercase) {
        return Err(ScrubError::InvalidVr { offset: pos + 4 });
    }

    if LONG_VRS.contains(&&vr) {
        Ok(Header {
            tag,
            vr: Some(vr),
            length: read_u32(data, pos + 8)?,
            header_len: 12,
            length_width: 4,
        })
    } else {
        Ok(Header {
            tag,
            vr: Some(vr),
            length: read_u16(data, pos + 6)? as u32,
            header_len: 8,
            length_width: 2,
        })
    }
}

/// Offset just past the element at `pos`, following undefined-length
/// sequences to their delimiter.
fn element_end(
    data: &[u8],
    pos: usize,
    header: &Header,
    explicit: bool,
) -> Result<usize, ScrubError> {
    let start = pos + header.header_len;
    if header.length != UNDEFINED_LENGTH {
        return checked_end(data, start, header.length);
    }
    // UN with undefined length nests an implicit VR sequence.
    let nested_explicit = explicit && header.vr != Some(*b"UN");
    skip_sequence(data, start, nested_explicit)
}

/// Open container while skipping nested data. The flag is the VR mode of
/// the elements inside it.
#[derive(Clone, Copy)]
enum Open {
    Sequence(bool),
    Item(bool),
}

/// Walks an undefined-length sequence to just past its delimiter. Nesting is
/// tracked on an explicit stack bounded by [`MAX_SEQUENCE_DEPTH`].
fn skip_sequence(data: &[u8], mut pos: usize, explicit: bool) -> Result<usize, ScrubError> {
    let mut open = vec![Open::Sequence(explicit)];
    while let Some(&top) = open.last() {
        match top {
            Open::Sequence(explicit) => {
                let header = read_header(data, pos, explicit)?;
                let start = pos + header.header_len;
                match header.tag {
                    SEQUENCE_DELIMITATION => {
                        open.pop();
                        pos = start;
                    }
                    ITEM if header.length == UNDEFINED_LENGTH => {
                        open.push(Open::Item(explicit));
                        pos = start;
                    }
                    ITEM => pos = checked_end(data, start, header.length)?,
                    tag => return Err(ScrubError::UnexpectedTag { tag, offset: pos }),
                }
            }
            Open::Item(explicit) => {
                let header = read_header(data, pos, explicit)?;
                let start = pos + header.header_len;
                if header.tag == ITEM_DELIMITATION {
                    open.pop();
                    pos = start;
                } else if header.length == UNDEFINED_LENGTH {
                    if open.len() >= 2 * MAX_SEQUENCE_DEPTH {
                        return Err(ScrubError::NestingTooDeep { offset: pos });
                    }
                    // UN with undefined length nests an implicit VR sequence.
                    open.push(Open::Sequence(explicit && header.vr != Some(*b"UN")));
                    pos = start;
                } else {
                    pos = checked_end(data, start, header.length)?;
                }
            }
        }
    }
    Ok(pos)
}

fn checked_end(data: &[u8], start: usize, length: u32) -> Result<usize, ScrubError> {
    let end = start
        .checked_add(length as usize)
        .ok_or(ScrubError::Truncated { offset: start })?;
    if end > data.len() {
        return Err(ScrubError::Truncated { offset: start });
    }
    Ok(end)
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16, ScrubError> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or(ScrubError::Truncated { offset: pos })
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32, ScrubError> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(ScrubError::Truncated { offset: pos })
}
