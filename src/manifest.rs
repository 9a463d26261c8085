//! Parsers for the two XML documents that drive Express packages: the
//! update manifest inside the MSU metadata cabinet, and the
//! `express.psf.cix.xml` index that maps logical files to byte ranges of
//! the PSF blob.
//!
//! Microsoft ships these with default and prefixed namespaces and with
//! varying element casing, so both are parsed into a small element tree
//! that is queried by case-insensitive local name.

use std::path::Path;

use base64::prelude::*;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::naming::basename;
use crate::records::PatchDirection;

#[derive(Debug, Clone, Default)]
pub struct Element {
    pub name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Element>,
}

impl Element {
    fn from_start(start: &BytesStart<'_>) -> std::result::Result<Self, quick_xml::Error> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(quick_xml::Error::from)?;
            if attr.key.as_namespace_binding().is_some() {
                continue;
            }
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr.unescape_value()?.into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            children: Vec::new(),
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children
            .iter()
            .filter(move |child| child.name.eq_ignore_ascii_case(name))
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|child| child.name.eq_ignore_ascii_case(name))
    }

    /// Follow the first child matching each name in turn.
    pub fn descend(&self, names: &[&str]) -> Option<&Element> {
        names
            .iter()
            .try_fold(self, |element, name| element.child(name))
    }
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

/// Parse an XML document into an [`Element`] tree, dropping namespaces.
pub fn parse_element_tree(text: &str, path: &Path) -> Result<Element> {
    let xml_error = |source| Error::Xml {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;
    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(start) => stack.push(Element::from_start(&start).map_err(xml_error)?),
            Event::Empty(start) => {
                let element = Element::from_start(&start).map_err(xml_error)?;
                attach(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| Error::manifest(path, "unbalanced closing tag"))?;
                attach(&mut stack, &mut root, element);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(Error::manifest(path, "document ended inside an element"));
    }
    root.ok_or_else(|| Error::manifest(path, "document has no root element"))
}

/// Read a manifest file as text, honouring UTF-8 and UTF-16LE byte-order marks.
pub fn read_manifest_text(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        return Ok(String::from_utf16_lossy(&units));
    }
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&bytes);
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::manifest(path, e.to_string()))
}

fn required<'a>(element: &'a Element, attr: &str, path: &Path) -> Result<&'a str> {
    element.attr(attr).ok_or_else(|| {
        Error::manifest(
            path,
            format!("<{}> is missing attribute \"{attr}\"", element.name),
        )
    })
}

fn required_number(element: &Element, attr: &str, path: &Path) -> Result<u64> {
    let raw = required(element, attr, path)?;
    raw.trim().parse().map_err(|_| {
        Error::manifest(
            path,
            format!("<{}> attribute \"{attr}\" is not a number: {raw}", element.name),
        )
    })
}

fn parse_created_date(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(date) = DateTime::parse_from_rfc3339(raw) {
        return Some(date.naive_utc());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PayloadKind {
    ExpressCab,
    ExpressPsf,
    Other(String),
}

impl PayloadKind {
    fn parse(raw: &str) -> Self {
        match raw {
            "ExpressCab" => PayloadKind::ExpressCab,
            "ExpressPSF" => PayloadKind::ExpressPsf,
            other => PayloadKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PayloadDescriptor {
    pub hash: Option<String>,
    pub size: Option<u64>,
    pub path: String,
    pub kind: PayloadKind,
}

impl PayloadDescriptor {
    /// Name of the payload inside the MSU.
    pub fn file_name(&self) -> &str {
        basename(&self.path)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateManifest {
    pub created: NaiveDateTime,
    pub os_base_version: String,
    pub os_target_version: String,
    pub arch: String,
    pub feature_type: String,
    pub payloads: Vec<PayloadDescriptor>,
}

impl UpdateManifest {
    pub fn parse(path: &Path) -> Result<Self> {
        debug!("Parsing update manifest {}", path.display());
        let text = read_manifest_text(path)?;
        let root = parse_element_tree(&text, path)?;
        Self::from_element(&root, path)
    }

    pub fn from_element(root: &Element, path: &Path) -> Result<Self> {
        let created_raw = required(root, "CreatedDate", path)?;
        let created = parse_created_date(created_raw).ok_or_else(|| {
            Error::manifest(path, format!("unreadable CreatedDate \"{created_raw}\""))
        })?;

        let feature = root
            .descend(&["Features", "Feature"])
            .ok_or_else(|| Error::manifest(path, "missing Features/Feature"))?;

        let package = root
            .descend(&["Packages", "Package"])
            .ok_or_else(|| Error::manifest(path, "missing Packages/Package"))?;

        // Payload attributes sit either on <Payload> itself or on the items it wraps.
        let items = package.children_named("Payload").flat_map(|payload| {
            if payload.children.is_empty() {
                std::slice::from_ref(payload)
            } else {
                payload.children.as_slice()
            }
        });

        let mut payloads = Vec::new();
        for payload in items {
            payloads.push(PayloadDescriptor {
                hash: payload.attr("PayloadHash").map(str::to_string),
                size: payload
                    .attr("PayloadSize")
                    .map(|_| required_number(payload, "PayloadSize", path))
                    .transpose()?,
                path: required(payload, "Path", path)?.to_string(),
                kind: PayloadKind::parse(required(payload, "PayloadType", path)?),
            });
        }

        Ok(Self {
            created,
            os_base_version: required(root, "OSVersion", path)?.to_string(),
            os_target_version: required(root, "TargetOSVersion", path)?.to_string(),
            arch: required(root, "BuildArch", path)?.to_string(),
            feature_type: required(feature, "Type", path)?.to_string(),
            payloads,
        })
    }

    fn single_payload(&self, kind: &PayloadKind) -> Result<&PayloadDescriptor> {
        let mut matching = self.payloads.iter().filter(|p| &p.kind == kind);
        match (matching.next(), matching.next()) {
            (Some(payload), None) => Ok(payload),
            (None, _) => Err(Error::FormatVariantMismatch(format!("no {kind:?} payload"))),
            (Some(_), Some(_)) => Err(Error::FormatVariantMismatch(format!(
                "more than one {kind:?} payload"
            ))),
        }
    }

    /// The Express CAB and PSF payloads, each of which must appear exactly once.
    pub fn express_payloads(&self) -> Result<(&PayloadDescriptor, &PayloadDescriptor)> {
        Ok((
            self.single_payload(&PayloadKind::ExpressCab)?,
            self.single_payload(&PayloadKind::ExpressPsf)?,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeclaredHash {
    pub alg: String,
    pub value: String,
}

impl DeclaredHash {
    fn from_element(hash: &Element, path: &Path) -> Result<Self> {
        Ok(Self {
            alg: required(hash, "alg", path)?.to_string(),
            value: required(hash, "value", path)?.to_string(),
        })
    }

    /// The declared digest as lowercase hex, if it is a SHA-256 written in
    /// hex or base64. Other algorithms cannot be checked.
    pub fn sha256_hex(&self) -> Option<String> {
        let alg = self.alg.replace('-', "");
        if !alg.eq_ignore_ascii_case("sha256") {
            return None;
        }
        let value = self.value.trim();
        if value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Some(value.to_ascii_lowercase());
        }
        BASE64_STANDARD
            .decode(value)
            .ok()
            .filter(|digest| digest.len() == 32)
            .map(hex::encode)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpressManifestEntry {
    /// Logical path, e.g. `amd64_microsoft-windows-os-kernel_..._none_...\f\ntoskrnl.exe`.
    pub file_name: String,
    pub real_file_name: String,
    pub direction: PatchDirection,
    pub diff_type: String,
    pub offset: u64,
    pub length: u64,
    /// Hash of the delta bytes.
    pub hash: DeclaredHash,
    /// Hash of the finished file.
    pub target_hash: Option<DeclaredHash>,
}

impl ExpressManifestEntry {
    fn from_element(file: &Element, path: &Path) -> Result<Self> {
        let file_name = required(file, "name", path)?.to_string();
        let source = file
            .descend(&["Delta", "Source"])
            .ok_or_else(|| Error::manifest(path, format!("{file_name}: missing Delta/Source")))?;
        let hash = source
            .child("Hash")
            .ok_or_else(|| Error::manifest(path, format!("{file_name}: missing Source/Hash")))?;

        let segments: Vec<&str> = file_name.split(['\\', '/']).collect();
        let direction = segments
            .len()
            .checked_sub(2)
            .and_then(|idx| segments[idx].parse().ok())
            .ok_or_else(|| {
                Error::manifest(
                    path,
                    format!("{file_name}: parent directory is not one of f, r, n"),
                )
            })?;

        Ok(Self {
            real_file_name: basename(&file_name).to_string(),
            direction,
            diff_type: required(source, "type", path)?.to_string(),
            offset: required_number(source, "offset", path)?,
            length: required_number(source, "length", path)?,
            hash: DeclaredHash::from_element(hash, path)?,
            target_hash: file
                .child("Hash")
                .map(|hash| DeclaredHash::from_element(hash, path))
                .transpose()?,
            file_name,
        })
    }

    /// Exclusive end of the entry inside the blob, `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpressManifest {
    pub patch_name: String,
    pub entries: Vec<ExpressManifestEntry>,
}

static PATCH_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<patch_name>[\w.]+?)-\w+.*\.\w+$").expect("static pattern is valid")
});

impl ExpressManifest {
    pub fn parse(path: &Path) -> Result<Self> {
        debug!("Parsing express manifest {}", path.display());
        let text = read_manifest_text(path)?;
        let root = parse_element_tree(&text, path)?;
        Self::from_element(&root, path)
    }

    pub fn from_element(root: &Element, path: &Path) -> Result<Self> {
        let name = required(root, "name", path)?;
        let patch_name = PATCH_NAME
            .captures(name)
            .map(|caps| caps["patch_name"].to_string())
            .ok_or_else(|| Error::manifest(path, format!("cannot parse patch name \"{name}\"")))?;

        let files = root
            .child("Files")
            .ok_or_else(|| Error::manifest(path, "missing Files"))?;
        let entries = files
            .children_named("File")
            .map(|file| ExpressManifestEntry::from_element(file, path))
            .collect::<Result<Vec<_>>>()?;

        debug!("Express manifest \"{patch_name}\" lists {} files", entries.len());
        Ok(Self {
            patch_name,
            entries,
        })
    }
}

/// Convenience used by callers that only need the ordered entries.
pub fn parse_express_manifest(path: &Path) -> Result<Vec<ExpressManifestEntry>> {
    ExpressManifest::parse(path).map(|manifest| manifest.entries)
}

pub fn parse_update_manifest(path: &Path) -> Result<UpdateManifest> {
    UpdateManifest::parse(path)
}
