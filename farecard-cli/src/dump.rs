//! Card dump and station file loading.
//!
//! Input formats:
//! - MIFARE Classic Tool text: `+Sector: N` headers, one block of hex per line,
//!   `-` for bytes that could not be read.
//! - Line format: `<selector>: <hex>` or `<selector>: unauthorized`, with
//!   `# kind: <classic|iso7816|ultralight>` and `# tag: <hex>` headers.

use std::fs;
use std::path::Path;

use farecard_core::{ByteBuffer, CardDump, CardKind, Selector, StationTable};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

fn syntax(line: usize, message: impl Into<String>) -> DumpError {
    DumpError::Syntax {
        line: line + 1,
        message: message.into(),
    }
}

fn read(path: &Path) -> Result<String, DumpError> {
    fs::read_to_string(path).map_err(|source| DumpError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Load a dump file in either format.
pub fn load_dump(path: &Path) -> Result<CardDump, DumpError> {
    parse_dump(&read(path)?)
}

pub fn parse_dump(text: &str) -> Result<CardDump, DumpError> {
    let first = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'));
    match first {
        Some(l) if l.starts_with("+Sector:") => parse_mct(text),
        _ => parse_lines(text),
    }
}

// ---------------------------------------------------------------------------
// MIFARE Classic Tool
// ---------------------------------------------------------------------------

/// One block line: `None` if every byte is unread, unread bytes in a partially
/// read block become zero.
fn parse_block(line: &str) -> Option<Option<ByteBuffer>> {
    if line.len() % 2 != 0 {
        return None;
    }
    if line.chars().all(|c| c == '-') {
        return Some(None);
    }
    let filled: String = line
        .as_bytes()
        .chunks(2)
        .map(|pair| if pair == b"--" { "00" } else { std::str::from_utf8(pair).unwrap_or("zz") })
        .collect();
    ByteBuffer::from_hex(&filled).ok().map(Some)
}

/// UID from manufacturer block 0: 7 bytes when it starts with the 0x04 (NXP)
/// double-size marker, else 4.
fn manufacturer_uid(block0: &ByteBuffer) -> Option<ByteBuffer> {
    let len = if block0.as_bytes().first() == Some(&0x04) { 7 } else { 4 };
    block0.slice(0, len).ok()
}

fn parse_mct(text: &str) -> Result<CardDump, DumpError> {
    let mut dump = CardDump::new(CardKind::MifareClassic, ByteBuffer::default());
    let mut sector: Option<u8> = None;
    let mut block = 0u8;
    let mut pending: Vec<(Selector, Option<ByteBuffer>)> = Vec::new();

    let flush = |dump: &mut CardDump, pending: &mut Vec<(Selector, Option<ByteBuffer>)>| {
        let unreadable = pending.iter().all(|(_, data)| data.is_none());
        for (selector, data) in pending.drain(..) {
            match data {
                Some(data) => dump.insert(selector, data),
                None => dump.insert_unauthorized(selector),
            }
        }
        unreadable
    };

    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(n) = line.strip_prefix("+Sector:") {
            if let Some(prev) = sector {
                if flush(&mut dump, &mut pending) {
                    debug!(sector = prev, "sector unreadable");
                }
            }
            let n = n
                .trim()
                .parse()
                .map_err(|_| syntax(i, format!("bad sector number {n:?}")))?;
            sector = Some(n);
            block = 0;
            continue;
        }
        let Some(s) = sector else {
            return Err(syntax(i, "block before first +Sector header"));
        };
        let data = parse_block(line).ok_or_else(|| syntax(i, format!("bad block {line:?}")))?;
        if s == 0 && block == 0 {
            if let Some(uid) = data.as_ref().and_then(manufacturer_uid) {
                dump.set_tag_id(uid);
            }
        }
        pending.push((Selector::sector_block(s, block), data));
        block = block.saturating_add(1);
    }
    if let Some(prev) = sector {
        if flush(&mut dump, &mut pending) {
            debug!(sector = prev, "sector unreadable");
        }
    }
    Ok(dump)
}

// ---------------------------------------------------------------------------
// Line format
// ---------------------------------------------------------------------------

fn parse_kind(name: &str) -> Option<CardKind> {
    match name.to_ascii_lowercase().as_str() {
        "classic" | "mifare_classic" => Some(CardKind::MifareClassic),
        "iso7816" | "calypso" => Some(CardKind::Iso7816),
        "ultralight" => Some(CardKind::Ultralight),
        _ => None,
    }
}

fn parse_lines(text: &str) -> Result<CardDump, DumpError> {
    let mut kind = CardKind::Iso7816;
    let mut tag = ByteBuffer::default();
    let mut entries: Vec<(Selector, Option<ByteBuffer>)> = Vec::new();

    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('#') {
            if let Some((key, val)) = header.split_once(':') {
                let val = val.trim();
                match key.trim() {
                    "kind" => {
                        kind = parse_kind(val)
                            .ok_or_else(|| syntax(i, format!("unknown card kind {val:?}")))?;
                    }
                    "tag" => {
                        tag = ByteBuffer::from_hex(val).map_err(|_| syntax(i, "bad tag id"))?;
                    }
                    _ => {}
                }
            }
            continue;
        }
        // Named selectors contain a colon themselves, so split on the last one.
        let (sel, val) = line
            .rsplit_once(':')
            .ok_or_else(|| syntax(i, "expected `<selector>: <hex>`"))?;
        let selector = Selector::parse(sel)
            .ok_or_else(|| syntax(i, format!("bad selector {:?}", sel.trim())))?;
        let data = match val.trim() {
            "unauthorized" => None,
            hex => Some(ByteBuffer::from_hex(hex).map_err(|_| syntax(i, "bad hex payload"))?),
        };
        entries.push((selector, data));
    }

    let mut dump = CardDump::new(kind, tag);
    for (selector, data) in entries {
        match data {
            Some(data) => dump.insert(selector, data),
            None => dump.insert_unauthorized(selector),
        }
    }
    Ok(dump)
}

// ---------------------------------------------------------------------------
// Stations
// ---------------------------------------------------------------------------

fn parse_id(text: &str) -> Option<u32> {
    let text = text.trim();
    match text.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Station names, one `agency,id,name` per line. `*` as agency matches any.
pub fn load_stations(path: &Path) -> Result<StationTable, DumpError> {
    parse_stations(&read(path)?)
}

pub fn parse_stations(text: &str) -> Result<StationTable, DumpError> {
    let mut table = StationTable::new();
    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(3, ',');
        let (Some(agency), Some(id), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(syntax(i, "expected `agency,id,name`"));
        };
        let agency = match agency.trim() {
            "*" => None,
            a => Some(parse_id(a).ok_or_else(|| syntax(i, "bad agency"))?),
        };
        let id = parse_id(id).ok_or_else(|| syntax(i, "bad station id"))?;
        table.insert(agency, id, name.trim());
    }
    Ok(table)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
