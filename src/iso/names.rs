//! Identifier mangling for the primary (level 1, 8.3 d-characters) and
//! Joliet (UCS-2, 64 characters) hierarchies.

use std::collections::HashSet;

const PRIMARY_BASE_LEN: usize = 8;
const PRIMARY_EXTENSION_LEN: usize = 3;
pub const JOLIET_NAME_LEN: usize = 64;
const VERSION_SUFFIX: &str = ";1";

/// Upper case, everything outside `A-Z 0-9 _` becomes `_`.
pub fn d_characters(value: &str) -> String {
    value
        .chars()
        .map(|c| match c.to_ascii_uppercase() {
            c @ ('A'..='Z' | '0'..='9' | '_') => c,
            _ => '_',
        })
        .collect()
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(dot) => (&name[..dot], &name[dot + 1..]),
    }
}

fn with_suffix(base: &str, suffix: &str, max: usize) -> String {
    let kept: String = base.chars().take(max.saturating_sub(suffix.chars().count())).collect();
    format!("{kept}{suffix}")
}

/// Makes `candidate(n)` unique among `taken`, trying `n = 0, 1, 2, ...`.
fn unique(taken: &mut HashSet<String>, candidate: impl Fn(usize) -> String) -> String {
    let mut attempt = 0;
    loop {
        let name = candidate(attempt);
        if taken.insert(name.clone()) {
            return name;
        }
        attempt += 1;
    }
}

/// Assigns level 1 identifiers to the children of one directory, in the
/// given order. Files always carry a dot and the `;1` version.
pub fn primary_identifiers<'a>(
    children: impl IntoIterator<Item = (&'a str, bool)>,
) -> Vec<String> {
    let mut taken = HashSet::new();

    children
        .into_iter()
        .map(|(name, is_directory)| {
            if is_directory {
                let base = non_empty(d_characters(name));
                unique(&mut taken, |attempt| match attempt {
                    0 => with_suffix(&base, "", PRIMARY_BASE_LEN),
                    n => with_suffix(&base, &format!("_{n}"), PRIMARY_BASE_LEN),
                })
            } else {
                let (base, extension) = split_extension(name);
                let base = non_empty(d_characters(base));
                let extension: String = d_characters(extension)
                    .chars()
                    .take(PRIMARY_EXTENSION_LEN)
                    .collect();
                let name = unique(&mut taken, |attempt| {
                    let base = match attempt {
                        0 => with_suffix(&base, "", PRIMARY_BASE_LEN),
                        n => with_suffix(&base, &format!("_{n}"), PRIMARY_BASE_LEN),
                    };
                    format!("{base}.{extension}")
                });
                format!("{name}{VERSION_SUFFIX}")
            }
        })
        .collect()
}

fn non_empty(value: String) -> String {
    if value.is_empty() {
        "_".to_owned()
    } else {
        value
    }
}

fn joliet_character(c: char) -> char {
    match c {
        '*' | '/' | ':' | ';' | '?' | '\\' => '_',
        c if (c as u32) < 0x20 => '_',
        c if (c as u32) > 0xFFFF => '_',
        c => c,
    }
}

/// Joliet names keep case and most punctuation, limited to 64 UCS-2
/// characters including the `;1` of files.
pub fn joliet_identifiers<'a>(children: impl IntoIterator<Item = (&'a str, bool)>) -> Vec<String> {
    let mut taken = HashSet::new();

    children
        .into_iter()
        .map(|(name, is_directory)| {
            let cleaned: String = name.chars().map(joliet_character).collect();
            let max = if is_directory {
                JOLIET_NAME_LEN
            } else {
                JOLIET_NAME_LEN - VERSION_SUFFIX.len()
            };

            let name = unique(&mut taken, |attempt| {
                let suffix = match attempt {
                    0 => String::new(),
                    n => format!("~{n}"),
                };
                if is_directory {
                    return with_suffix(&cleaned, &suffix, max);
                }
                // the extension survives truncation when it can
                let (base, extension) = split_extension(&cleaned);
                let tail = if extension.is_empty() {
                    suffix.clone()
                } else {
                    format!("{suffix}.{extension}")
                };
                if tail.chars().count() < max {
                    with_suffix(base, &tail, max)
                } else {
                    with_suffix(&cleaned, &suffix, max)
                }
            });

            if is_directory {
                name
            } else {
                format!("{name}{VERSION_SUFFIX}")
            }
        })
        .collect()
}

/// Big endian UCS-2. Identifiers are cleaned by `joliet_identifiers`
/// beforehand, only characters outside the BMP are replaced here.
pub fn ucs2_be(value: &str) -> Vec<u8> {
    value
        .chars()
        .map(|c| if (c as u32) > 0xFFFF { '_' } else { c })
        .flat_map(|c| (c as u32 as u16).to_be_bytes())
        .collect()
}

pub fn decode_ucs2_be(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Drops the `;version` suffix and a dangling dot.
pub fn strip_version(identifier: &str) -> &str {
    let name = match identifier.rfind(';') {
        Some(semicolon) => &identifier[..semicolon],
        None => identifier,
    };
    match name.strip_suffix('.') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => name,
    }
}
