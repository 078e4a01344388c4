//! Parsers for the line-oriented answers of the device filesystem, shared by
//! the UART bootloader shell and the fieldbus file services.

use std::collections::BTreeMap;

/// Usage counters of the device filesystem, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilesystemInfo {
    pub free: u64,
    pub used: u64,
    pub total: u64,
}

/// Parse a file listing of "name size" lines into a name to size map.
///
/// Lines that do not end in a number are chatter and skipped. A file name may
/// itself contain spaces.
pub fn parse_file_list(text: &str) -> BTreeMap<String, u32> {
    let mut files = BTreeMap::new();
    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 {
            continue;
        }
        let Ok(size) = tokens[tokens.len() - 1].parse::<u32>() else {
            continue;
        };
        let name = tokens[..tokens.len() - 1].join(" ");
        files.insert(name, size);
    }
    files
}

/// Parse the free/used/total counters out of a filesystem info answer.
///
/// The counters are the first three numbers in the text, in that order.
pub fn parse_fs_info(text: &str) -> Option<FilesystemInfo> {
    let mut numbers = text
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| !token.is_empty())
        .filter_map(|token| token.parse::<u64>().ok());
    Some(FilesystemInfo {
        free: numbers.next()?,
        used: numbers.next()?,
        total: numbers.next()?,
    })
}
