//! Container timezone discovery
//!
//! Reads `/etc/localtime` through the container's filesystem view and parses
//! the TZif data it points at. Only the information needed to answer "which
//! zone and offset is this container in right now" is kept.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Name reported when `/etc/localtime` is a plain file
pub const UNKNOWN_ZONE: &str = "UNKNOWN";

const ETC_LOCALTIME: &str = "/etc/localtime";
const ZONEINFO_DIR: &str = "/usr/share/zoneinfo/";

#[derive(Debug, Clone, PartialEq)]
struct LocalTimeType {
    offset: i32,
    is_dst: bool,
    abbr: String,
}

/// A parsed TZif zone
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    name: String,
    transitions: Vec<i64>,
    indices: Vec<u8>,
    types: Vec<LocalTimeType>,
    /// Fixed rule from the TZif footer, used after the last transition
    footer: Option<LocalTimeType>,
}

impl Location {
    pub fn utc() -> Self {
        Self::fixed("UTC", "UTC", 0)
    }

    pub fn fixed(name: &str, abbr: &str, offset: i32) -> Self {
        Self {
            name: name.to_string(),
            transitions: Vec::new(),
            indices: Vec::new(),
            types: vec![LocalTimeType {
                offset,
                is_dst: false,
                abbr: abbr.to_string(),
            }],
            footer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Zone abbreviation and UTC offset in seconds in effect at `unix_secs`
    pub fn lookup(&self, unix_secs: i64) -> (String, i32) {
        let idx = self.transitions.partition_point(|t| *t <= unix_secs);
        let ty = if idx == 0 {
            self.types.iter().find(|t| !t.is_dst).or(self.types.first())
        } else if idx == self.transitions.len() && self.footer.is_some() {
            self.footer.as_ref()
        } else {
            self.indices
                .get(idx - 1)
                .and_then(|i| self.types.get(*i as usize))
        };

        match ty {
            Some(t) => (t.abbr.clone(), t.offset),
            None => ("UTC".to_string(), 0),
        }
    }

    /// Parse TZif bytes (versions 1 to 4)
    pub fn from_tzif(name: &str, data: &[u8]) -> Option<Self> {
        let header = Header::parse(data)?;
        let (header, body, time_size) = if header.version >= b'2' {
            // Skip the 32-bit block, the 64-bit one follows it
            let v2 = data.get(header.v1_block_len() + 44..)?;
            (Header::parse(&data[header.v1_block_len()..])?, v2, 8)
        } else {
            (header, data.get(44..)?, 4)
        };

        let mut cursor = Cursor { data: body, pos: 0 };
        let mut transitions = Vec::with_capacity(header.timecnt);
        for _ in 0..header.timecnt {
            let t = if time_size == 8 {
                cursor.i64()?
            } else {
                cursor.i32()? as i64
            };
            transitions.push(t);
        }
        let indices = cursor.take(header.timecnt)?.to_vec();

        let mut raw_types = Vec::with_capacity(header.typecnt);
        for _ in 0..header.typecnt {
            let offset = cursor.i32()?;
            let is_dst = cursor.take(1)?[0] != 0;
            let abbr_idx = cursor.take(1)?[0] as usize;
            raw_types.push((offset, is_dst, abbr_idx));
        }
        let chars = cursor.take(header.charcnt)?;
        let types = raw_types
            .into_iter()
            .map(|(offset, is_dst, abbr_idx)| {
                let abbr = chars
                    .get(abbr_idx..)
                    .and_then(|rest| rest.split(|b| *b == 0).next())
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                LocalTimeType {
                    offset,
                    is_dst,
                    abbr,
                }
            })
            .collect::<Vec<_>>();
        if types.is_empty() || indices.iter().any(|i| *i as usize >= types.len()) {
            return None;
        }

        let footer = if time_size == 8 {
            let skip = header.leapcnt * 12 + header.isstdcnt + header.isutcnt;
            cursor
                .take(skip)
                .and_then(|_| cursor.rest())
                .and_then(parse_footer)
        } else {
            None
        };

        Some(Self {
            name: name.to_string(),
            transitions,
            indices,
            types,
            footer,
        })
    }
}

impl Default for Location {
    fn default() -> Self {
        Self::utc()
    }
}

struct Header {
    version: u8,
    isutcnt: usize,
    isstdcnt: usize,
    leapcnt: usize,
    timecnt: usize,
    typecnt: usize,
    charcnt: usize,
}

impl Header {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 44 || &data[..4] != b"TZif" {
            return None;
        }
        let count = |i: usize| -> usize {
            let off = 20 + i * 4;
            u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]) as usize
        };
        Some(Self {
            version: data[4],
            isutcnt: count(0),
            isstdcnt: count(1),
            leapcnt: count(2),
            timecnt: count(3),
            typecnt: count(4),
            charcnt: count(5),
        })
    }

    fn v1_block_len(&self) -> usize {
        44 + self.timecnt * 5
            + self.typecnt * 6
            + self.charcnt
            + self.leapcnt * 8
            + self.isstdcnt
            + self.isutcnt
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn i32(&mut self) -> Option<i32> {
        let b = self.take(4)?;
        Some(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Option<i64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Some(i64::from_be_bytes(buf))
    }

    fn rest(&mut self) -> Option<&'a [u8]> {
        self.data.get(self.pos..)
    }
}

/// Parse a POSIX TZ footer without DST rules, e.g. `CST-8` or `<+0530>-5:30`
fn parse_footer(raw: &[u8]) -> Option<LocalTimeType> {
    let text = std::str::from_utf8(raw).ok()?;
    let tz = text.trim_matches('\n').lines().next()?;
    let (abbr, rest) = if let Some(stripped) = tz.strip_prefix('<') {
        let end = stripped.find('>')?;
        (&stripped[..end], &stripped[end + 1..])
    } else {
        let end = tz.find(|c: char| !c.is_ascii_alphabetic())?;
        (&tz[..end], &tz[end..])
    };
    if abbr.is_empty() {
        return None;
    }

    let (sign, digits) = match rest.as_bytes().first()? {
        b'-' => (1, &rest[1..]),
        b'+' => (-1, &rest[1..]),
        _ => (-1, rest),
    };
    // Anything after the offset is a DST rule we do not evaluate
    if digits.contains(|c: char| !(c.is_ascii_digit() || c == ':')) {
        return None;
    }
    let mut secs = 0i32;
    for (i, part) in digits.split(':').enumerate() {
        let v: i32 = part.parse().ok()?;
        secs += v * [3600, 60, 1].get(i)?;
    }

    Some(LocalTimeType {
        offset: sign * secs,
        is_dst: false,
        abbr: abbr.to_string(),
    })
}

/// Timezone information resolved for one container
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimezoneDescriptor {
    pub env_tz: Option<String>,
    pub etc_localtime: String,
    pub name: String,
    #[serde(skip)]
    pub location: Arc<Location>,
    pub zone: String,
    /// Seconds east of UTC
    pub offset: i32,
}

impl Default for TimezoneDescriptor {
    fn default() -> Self {
        Self {
            env_tz: None,
            etc_localtime: String::new(),
            name: "UTC".to_string(),
            location: Arc::new(Location::utc()),
            zone: "UTC".to_string(),
            offset: 0,
        }
    }
}

/// Resolve the timezone of a container
///
/// `translate(path, follow_symlinks)` maps an in-container path onto the host.
/// Failures at any step leave the corresponding field at its UTC default.
pub fn resolve_timezone<F>(env_tz: Option<&str>, now_secs: i64, translate: F) -> TimezoneDescriptor
where
    F: Fn(&str, bool) -> Option<PathBuf>,
{
    let mut desc = TimezoneDescriptor {
        env_tz: env_tz.map(str::to_string),
        ..Default::default()
    };

    if let Some(host) = translate(ETC_LOCALTIME, false) {
        match fs::symlink_metadata(&host) {
            Ok(meta) if meta.file_type().is_symlink() => {
                if let Some(name) = fs::read_link(&host)
                    .ok()
                    .and_then(|target| zone_name_from_link(&target))
                {
                    desc.etc_localtime = name.clone();
                    let loc = translate(&format!("{ZONEINFO_DIR}{name}"), true)
                        .or_else(|| translate(ETC_LOCALTIME, true))
                        .and_then(|p| load(&name, &p));
                    if let Some(loc) = loc {
                        desc.location = Arc::new(loc);
                    }
                }
            }
            Ok(_) => {
                desc.etc_localtime = UNKNOWN_ZONE.to_string();
                if let Some(loc) = load(UNKNOWN_ZONE, &host) {
                    desc.location = Arc::new(loc);
                }
            }
            Err(_) => {}
        }
    }
    desc.name = desc.location.name().to_string();

    if let Some(tz) = env_tz.map(|tz| tz.trim_start_matches(':')).filter(|tz| !tz.is_empty()) {
        desc.name = tz.to_string();
        let loc = translate(&format!("{ZONEINFO_DIR}{tz}"), true)
            .and_then(|p| load(tz, &p))
            .or_else(|| load(tz, &Path::new(ZONEINFO_DIR).join(tz)));
        if let Some(loc) = loc {
            desc.location = Arc::new(loc);
        }
    }

    let (zone, offset) = desc.location.lookup(now_secs);
    desc.zone = zone;
    desc.offset = offset;
    desc
}

fn zone_name_from_link(target: &Path) -> Option<String> {
    let text = target.to_string_lossy();
    text.find("zoneinfo/")
        .map(|i| text[i + "zoneinfo/".len()..].to_string())
        .filter(|name| !name.is_empty())
}

fn load(name: &str, path: &Path) -> Option<Location> {
    fs::read(path)
        .ok()
        .and_then(|data| Location::from_tzif(name, &data))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Build a v2 TZif file with the given transitions and types
    pub(crate) fn build_tzif(
        transitions: &[(i64, u8)],
        types: &[(i32, bool, &str)],
        footer: &str,
    ) -> Vec<u8> {
        let mut chars = Vec::new();
        let mut abbr_idx = Vec::new();
        for (_, _, abbr) in types {
            abbr_idx.push(chars.len() as u8);
            chars.extend_from_slice(abbr.as_bytes());
            chars.push(0);
        }

        let header = |version: u8| {
            let mut h = b"TZif".to_vec();
            h.push(version);
            h.extend_from_slice(&[0u8; 15]);
            for count in [0, 0, 0, transitions.len(), types.len(), chars.len()] {
                h.extend_from_slice(&(count as u32).to_be_bytes());
            }
            h
        };

        let mut out = header(b'2');
        for (t, _) in transitions {
            out.extend_from_slice(&(*t as i32).to_be_bytes());
        }
        for (_, i) in transitions {
            out.push(*i);
        }
        for ((offset, dst, _), idx) in types.iter().zip(&abbr_idx) {
            out.extend_from_slice(&offset.to_be_bytes());
            out.push(*dst as u8);
            out.push(*idx);
        }
        out.extend_from_slice(&chars);

        out.extend_from_slice(&header(b'2'));
        for (t, _) in transitions {
            out.extend_from_slice(&t.to_be_bytes());
        }
        for (_, i) in transitions {
            out.push(*i);
        }
        for ((offset, dst, _), idx) in types.iter().zip(&abbr_idx) {
            out.extend_from_slice(&offset.to_be_bytes());
            out.push(*dst as u8);
            out.push(*idx);
        }
        out.extend_from_slice(&chars);
        out.push(b'\n');
        out.extend_from_slice(footer.as_bytes());
        out.push(b'\n');
        out
    }

    fn shanghai() -> Vec<u8> {
        build_tzif(&[(-2177481943, 0), (0, 0)], &[(28800, false, "CST")], "CST-8")
    }

    #[test]
    fn test_tzif_lookup_latest_transition() {
        let data = build_tzif(
            &[(1000, 1), (2000, 0)],
            &[(3600, false, "STD"), (7200, true, "DST")],
            "",
        );
        let loc = Location::from_tzif("Test/Zone", &data).unwrap();

        assert_eq!(loc.lookup(500), ("STD".to_string(), 3600));
        assert_eq!(loc.lookup(1500), ("DST".to_string(), 7200));
        assert_eq!(loc.lookup(2500), ("STD".to_string(), 3600));
    }

    #[test]
    fn test_footer_applies_after_last_transition() {
        let loc = Location::from_tzif("Asia/Shanghai", &shanghai()).unwrap();
        assert_eq!(loc.lookup(1_700_000_000), ("CST".to_string(), 28800));

        let india = parse_footer(b"<+0530>-5:30").unwrap();
        assert_eq!(india.offset, 5 * 3600 + 30 * 60);
        assert_eq!(india.abbr, "+0530");

        assert!(parse_footer(b"CET-1CEST,M3.5.0,M10.5.0/3").is_none());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(Location::from_tzif("x", b"not a tzif file at all, definitely not").is_none());
    }

    fn host_translator(root: &Path) -> impl Fn(&str, bool) -> Option<PathBuf> + '_ {
        move |p: &str, follow: bool| {
            let mut host = root.join(p.trim_start_matches('/'));
            if follow {
                while let Ok(target) = fs::read_link(&host) {
                    host = root.join(target.to_string_lossy().trim_start_matches('/'));
                }
            }
            Some(host)
        }
    }

    #[test]
    fn test_resolve_from_symlink() {
        let root = TempDir::new().unwrap();
        let zoneinfo = root.path().join("usr/share/zoneinfo/Asia");
        fs::create_dir_all(&zoneinfo).unwrap();
        fs::write(zoneinfo.join("Shanghai"), shanghai()).unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        std::os::unix::fs::symlink(
            "/usr/share/zoneinfo/Asia/Shanghai",
            root.path().join("etc/localtime"),
        )
        .unwrap();

        let desc = resolve_timezone(None, 1_700_000_000, host_translator(root.path()));

        assert_eq!(desc.etc_localtime, "Asia/Shanghai");
        assert_eq!(desc.name, "Asia/Shanghai");
        assert_eq!(desc.zone, "CST");
        assert_eq!(desc.offset, 28800);
    }

    #[test]
    fn test_resolve_regular_file_is_unknown() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/localtime"), shanghai()).unwrap();

        let desc = resolve_timezone(None, 1_700_000_000, host_translator(root.path()));

        assert_eq!(desc.etc_localtime, UNKNOWN_ZONE);
        assert_eq!(desc.offset, 28800);
    }

    #[test]
    fn test_resolve_defaults_to_utc() {
        let root = TempDir::new().unwrap();
        let desc = resolve_timezone(None, 1_700_000_000, host_translator(root.path()));

        assert_eq!(desc.name, "UTC");
        assert_eq!(desc.offset, 0);
        assert_eq!(desc.location.name(), "UTC");
    }

    #[test]
    fn test_env_tz_overrides_name() {
        let root = TempDir::new().unwrap();
        let zoneinfo = root.path().join("usr/share/zoneinfo/Asia");
        fs::create_dir_all(&zoneinfo).unwrap();
        fs::write(zoneinfo.join("Shanghai"), shanghai()).unwrap();

        let desc = resolve_timezone(
            Some(":Asia/Shanghai"),
            1_700_000_000,
            host_translator(root.path()),
        );

        assert_eq!(desc.env_tz.as_deref(), Some(":Asia/Shanghai"));
        assert_eq!(desc.name, "Asia/Shanghai");
        assert_eq!(desc.offset, 28800);
    }
}
