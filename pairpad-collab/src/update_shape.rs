//! Structural check of a yrs v1 update before it reaches the decoder.
//!
//! The decoder sizes its buffers from counts declared in the payload and
//! trusts string bytes to be UTF-8, so a single flipped byte can make it
//! allocate gigabytes or read invalid text. This walker reads the same
//! layout and rejects the payload if any declared count or length exceeds
//! what is left in the buffer.
//!
//! ```text
//! update      = clients:var { blocks:var client:var clock:var block* } delete_set
//! block       = info:u8 ( gc_len | skip_len | item )
//! item        = [origin:id] [right:id] [parent] [parent_sub:str] content
//! delete_set  = clients:var { client:var ranges:var { clock:var len:var }* }
//! ```
//!
//! Content kinds a room document never produces (sub-documents, moves,
//! weak links, legacy JSON) are rejected outright.

/// Payloads above this size are refused without being walked.
pub const MAX_UPDATE_BYTES: usize = 16 * 1024 * 1024;

const MAX_ANY_DEPTH: usize = 32;
const MAX_JSON_DEPTH: usize = 32;

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;

const CONTENT_DELETED: u8 = 1;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

type Check<T> = Result<T, String>;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Check<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| format!("unexpected end at byte {}", self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn skip(&mut self, n: usize) -> Check<()> {
        if n > self.remaining() {
            return Err(format!("{n} bytes declared, {} left", self.remaining()));
        }
        self.pos += n;
        Ok(())
    }

    /// lib0 unsigned varint, 7 bits per byte.
    fn var(&mut self) -> Check<u64> {
        let mut value: u64 = 0;
        for shift in (0..70).step_by(7) {
            let byte = self.u8()?;
            if shift == 63 && byte > 1 {
                return Err("varint overflows 64 bits".into());
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err("varint longer than 10 bytes".into())
    }

    fn var_u32(&mut self) -> Check<u32> {
        u32::try_from(self.var()?).map_err(|_| "value does not fit 32 bits".to_string())
    }

    /// Skip a varint without decoding it (signed integers in `Any`).
    fn skip_var(&mut self) -> Check<()> {
        for _ in 0..10 {
            if self.u8()? & 0x80 == 0 {
                return Ok(());
            }
        }
        Err("varint longer than 10 bytes".into())
    }

    /// A count of elements that each take at least `min_each` bytes.
    fn count(&mut self, min_each: usize) -> Check<usize> {
        let n = self.var_u32()? as usize;
        if n.saturating_mul(min_each) > self.remaining() {
            return Err(format!("{n} elements declared, {} bytes left", self.remaining()));
        }
        Ok(n)
    }

    fn bytes(&mut self) -> Check<&'a [u8]> {
        let len = self.var_u32()? as usize;
        let start = self.pos;
        self.skip(len)?;
        Ok(&self.buf[start..self.pos])
    }

    fn string(&mut self) -> Check<&'a str> {
        std::str::from_utf8(self.bytes()?).map_err(|e| format!("invalid UTF-8: {e}"))
    }

    fn id(&mut self) -> Check<()> {
        self.var_u32()?;
        self.var_u32()?;
        Ok(())
    }
}

/// Walk `payload` as a v1 update. `Ok` means every declared size fits.
pub fn check_update_v1(payload: &[u8]) -> Check<()> {
    if payload.len() > MAX_UPDATE_BYTES {
        return Err(format!("{} bytes exceeds the {MAX_UPDATE_BYTES} byte limit", payload.len()));
    }
    let mut c = Cursor { buf: payload, pos: 0 };

    let clients = c.count(3)?;
    for _ in 0..clients {
        let blocks = c.count(2)?;
        c.var_u32()?;
        let mut clock = u64::from(c.var_u32()?);
        for _ in 0..blocks {
            clock += block(&mut c)?;
            if clock > u64::from(u32::MAX) {
                return Err("block clock overflows 32 bits".into());
            }
        }
    }

    let clients = c.count(2)?;
    for _ in 0..clients {
        c.var_u32()?;
        let ranges = c.count(2)?;
        for _ in 0..ranges {
            let clock = u64::from(c.var_u32()?);
            let len = u64::from(c.var_u32()?);
            if clock + len > u64::from(u32::MAX) {
                return Err("deleted range overflows 32 bits".into());
            }
        }
    }
    Ok(())
}

/// Walk `payload` as a v1 state vector: `entries:var { client:var clock:var }*`.
pub fn check_state_vector_v1(payload: &[u8]) -> Check<()> {
    let mut c = Cursor { buf: payload, pos: 0 };
    let entries = c.count(2)?;
    for _ in 0..entries {
        c.var()?;
        c.var_u32()?;
    }
    Ok(())
}

// Returns the clock length the block occupies.
fn block(c: &mut Cursor<'_>) -> Check<u64> {
    let info = c.u8()?;
    match info {
        BLOCK_GC | BLOCK_SKIP => return Ok(u64::from(c.var_u32()?)),
        _ => {}
    }

    let has_origin = info & HAS_ORIGIN != 0;
    let has_right = info & HAS_RIGHT_ORIGIN != 0;
    if has_origin {
        c.id()?;
    }
    if has_right {
        c.id()?;
    }
    if !has_origin && !has_right {
        if c.var_u32()? == 1 {
            c.string()?;
        } else {
            c.id()?;
        }
        if info & HAS_PARENT_SUB != 0 {
            c.string()?;
        }
    }

    match info & 0b1111 {
        CONTENT_DELETED => Ok(u64::from(c.var_u32()?)),
        CONTENT_BINARY => c.bytes().map(|_| 1),
        CONTENT_STRING => Ok(c.string()?.encode_utf16().count() as u64),
        CONTENT_EMBED => json(c).map(|_| 1),
        CONTENT_FORMAT => {
            c.string()?;
            json(c).map(|_| 1)
        }
        CONTENT_TYPE => type_ref(c).map(|_| 1),
        CONTENT_ANY => {
            let n = c.count(1)?;
            for _ in 0..n {
                any(c, 0)?;
            }
            Ok(n as u64)
        }
        other => Err(format!("unsupported content kind {other}")),
    }
}

fn type_ref(c: &mut Cursor<'_>) -> Check<()> {
    match c.u8()? {
        // array, map, text, xml fragment, xml hook, xml text, undefined
        0 | 1 | 2 | 4 | 5 | 6 | 15 => Ok(()),
        // xml element carries its tag name
        3 => c.string().map(|_| ()),
        other => Err(format!("unsupported type ref {other}")),
    }
}

fn any(c: &mut Cursor<'_>, depth: usize) -> Check<()> {
    if depth > MAX_ANY_DEPTH {
        return Err("value nested too deeply".into());
    }
    match c.u8()? {
        127 | 126 | 121 | 120 => Ok(()),
        125 => c.skip_var(),
        124 => c.skip(4),
        123 | 122 => c.skip(8),
        119 => c.string().map(|_| ()),
        118 => {
            let n = c.count(2)?;
            for _ in 0..n {
                c.string()?;
                any(c, depth + 1)?;
            }
            Ok(())
        }
        117 => {
            let n = c.count(1)?;
            for _ in 0..n {
                any(c, depth + 1)?;
            }
            Ok(())
        }
        116 => c.bytes().map(|_| ()),
        tag => Err(format!("unknown value tag {tag}")),
    }
}

// Embedded JSON is parsed recursively by the decoder; bound its nesting.
fn json(c: &mut Cursor<'_>) -> Check<()> {
    let text = c.string()?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            match (escaped, ch) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' | '{' => {
                depth += 1;
                if depth > MAX_JSON_DEPTH {
                    return Err("embedded JSON nested too deeply".into());
                }
            }
            ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}
