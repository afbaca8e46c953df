// This module reversibly rewrites symbol names so they contain no bytes the
// system linker or assembler might treat specially. Safe bytes pass through;
// common punctuation becomes a short mnemonic and anything else becomes two
// hex digits, each escape terminated by a dot. The mapping is injective, so
// distinct front-end names never collide after sanitizing.

use crate::unit::CompilationUnit;

const HEX_CHARS: &[u8; 16] = b"0123456789ABCDEF";

fn is_safe_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$' || (128..255).contains(&c)
}

/// Mnemonics for frequent punctuation; everything unlisted prints as hex.
fn mnemonic(c: u8) -> Option<&'static str> {
    Some(match c {
        b' ' => "SP",
        b'!' => "NOT",
        b'"' => "DQT",
        b'#' => "YY",
        b'%' => "REM",
        b'&' => "AND",
        b'\'' => "SQT",
        b'(' => "LPR",
        b')' => "RPR",
        b'*' => "MUL",
        b'+' => "SUM",
        b'-' => "SUB",
        b'.' => "DOT",
        b'/' => "DIV",
        b':' => "COL",
        b'<' => "LT",
        b'=' => "EQ",
        b'>' => "GT",
        b'?' => "QQ",
        b'@' => "AT",
        b'[' => "LBR",
        b'\\' => "RDV",
        b']' => "RBR",
        b'^' => "POW",
        b'`' => "TIC",
        b'{' => "LCR",
        b'|' => "OR",
        b'}' => "RCR",
        b'~' => "TLD",
        0x7f => "DEL",
        _ => return None,
    })
}

/// Produce a linker-safe rendition of `name`, or `None` if it is already
/// safe.
pub fn safe_name(name: &str) -> Option<String> {
    if name.bytes().all(is_safe_byte) {
        return None;
    }
    let mut out = String::with_capacity(name.len() + 8);
    for c in name.bytes() {
        if is_safe_byte(c) {
            out.push(c as char);
        } else {
            match mnemonic(c) {
                Some(m) => out.push_str(m),
                None => {
                    out.push(HEX_CHARS[usize::from(c >> 4)] as char);
                    out.push(HEX_CHARS[usize::from(c & 0xf)] as char);
                }
            }
            out.push('.');
        }
    }
    Some(out)
}

/// Sanitize every symbol name in the unit, rewriting reference edges to
/// match. References are name-keyed, so renames must propagate unit-wide.
pub fn sanitize_names(unit: &mut CompilationUnit) {
    let renames: Vec<(String, String)> = unit
        .symbols()
        .filter_map(|s| safe_name(&s.name).map(|safe| (s.name.clone(), safe)))
        .collect();
    for (old, new) in &renames {
        // Renaming cannot collide: the escape alphabet ends every escape
        // with '.', which no already-safe name contains.
        if unit.rename(old, new).is_err() {
            log::warn!("skipping rename of `{old}`: `{new}` already taken");
            continue;
        }
        for symbol in unit.symbols_mut() {
            symbol.retarget(old, new);
        }
    }
}
