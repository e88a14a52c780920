//! Run-length codec for packet bodies. Every maximal run of the sentinel
//!  byte (length 1..=255) is replaced by the two-byte pair
//!  `(sentinel, run_length)`; longer runs are split into 255-or-fewer-byte
//!  chunks. In this protocol the sentinel is always the zero byte
//!  ("zero-coding"), but the codec is agnostic.
//!
//! Encoding can grow the data (a lone sentinel byte becomes two bytes), so
//!  callers size-check with [`encoded_len`] first and skip compression when
//!  it would not shrink the body.

use anyhow::{bail, ensure};

fn run_length(data: &[u8], code: u8) -> usize {
    data.iter().take_while(|&&b| b == code).count()
}

/// Exact length of `encode(data, code)` without producing it.
pub fn encoded_len(data: &[u8], code: u8) -> usize {
    let mut length = 0;
    let mut i = 0;
    while i < data.len() {
        if data[i] == code {
            let run = run_length(&data[i..], code);
            length += 2 * run.div_ceil(255);
            i += run;
        }
        else {
            length += 1;
            i += 1;
        }
    }
    length
}

/// Exact length of `decode(data, code)` without producing it. Fails on the
///  same inputs as `decode`: a truncated trailing pair or a zero run count.
pub fn decoded_len(data: &[u8], code: u8) -> anyhow::Result<usize> {
    let mut length = 0;
    let mut i = 0;
    while i < data.len() {
        if data[i] == code {
            ensure!(i + 1 < data.len(), "run-length pair truncated at offset {}", i);
            let count = data[i + 1];
            if count == 0 {
                bail!("run count of zero at offset {}", i);
            }
            length += count as usize;
            i += 2;
        }
        else {
            length += 1;
            i += 1;
        }
    }
    Ok(length)
}

pub fn encode(data: &[u8], code: u8) -> Vec<u8> {
    debug_assert!(!data.is_empty());

    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == code {
            let mut run = run_length(&data[i..], code);
            i += run;
            while run > 255 {
                out.push(code);
                out.push(255);
                run -= 255;
            }
            out.push(code);
            out.push(run as u8);
        }
        else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

pub fn decode(data: &[u8], code: u8) -> anyhow::Result<Vec<u8>> {
    debug_assert!(data.len() >= 2);

    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == code {
            ensure!(i + 1 < data.len(), "run-length pair truncated at offset {}", i);
            let count = data[i + 1];
            if count == 0 {
                bail!("run count of zero at offset {}", i);
            }
            out.extend(std::iter::repeat(code).take(count as usize));
            i += 2;
        }
        else {
            out.push(data[i]);
            i += 1;
        }
    }
    Ok(out)
}
