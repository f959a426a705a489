use crate::error::{EdfError, Result};
use crate::EDFLIB_TIME_DIMENSION;

/// 检查字符串是否为有效的整数
pub fn is_integer_number(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() {
        return false;
    }

    let digits = s.strip_prefix('+').or_else(|| s.strip_prefix('-')).unwrap_or(s);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// Header field bytes as a trimmed string.
pub fn field_str(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// 非本地化的整数解析（避免受系统locale影响）
pub fn parse_int_field(s: &str) -> Option<i64> {
    if !is_integer_number(s) {
        return None;
    }
    s.trim().trim_start_matches('+').parse().ok()
}

/// 非本地化的浮点数解析
pub fn parse_float_field(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() || s.contains(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }
    s.parse().ok().filter(|v: &f64| v.is_finite())
}

/// Parses a TAL time stamp (`[+-]seconds[.fraction]`) into seconds.
///
/// Onsets carry a mandatory sign, durations none. At most 7 decimals are
/// significant, matching the 100 ns time unit of EDF+.
pub fn parse_tal_time(s: &str, signed: bool) -> Result<f64> {
    let invalid = || EdfError::TalDecode(format!("invalid time stamp {:?}", s));

    // 处理符号
    let (negative, digits) = match (signed, s.as_bytes().first().copied()) {
        (true, Some(b'+')) => (false, &s[1..]),
        (true, Some(b'-')) => (true, &s[1..]),
        (false, Some(b'0'..=b'9')) => (false, s),
        _ => return Err(invalid()),
    };

    let (integer_part, decimal_part) = match digits.find('.') {
        Some(dot_pos) => (&digits[..dot_pos], &digits[dot_pos + 1..]),
        None => (digits, ""),
    };
    if integer_part.is_empty()
        || !integer_part.bytes().all(|b| b.is_ascii_digit())
        || !decimal_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(invalid());
    }

    let mut value = integer_part.parse::<i64>().map_err(|_| invalid())? * EDFLIB_TIME_DIMENSION;

    // 解析小数部分（最多7位精度）
    if !decimal_part.is_empty() {
        let decimal_str = &decimal_part[..decimal_part.len().min(7)];
        let decimal_value = decimal_str.parse::<i64>().map_err(|_| invalid())?;
        value += decimal_value * 10i64.pow(7 - decimal_str.len() as u32);
    }

    if negative {
        value = -value;
    }

    Ok(value as f64 / EDFLIB_TIME_DIMENSION as f64)
}

/// Formats seconds the way TAL time stamps are written: shortest decimal
/// form with at most 7 decimals, `+`/`-` prefixed when `signed`.
pub fn format_tal_time(seconds: f64, signed: bool) -> String {
    let magnitude = format!("{:.7}", seconds.abs());
    let magnitude = magnitude.trim_end_matches('0').trim_end_matches('.');
    let magnitude = if magnitude.is_empty() { "0" } else { magnitude };

    match (signed, seconds < 0.0 && magnitude != "0") {
        (true, true) => format!("-{}", magnitude),
        (true, false) => format!("+{}", magnitude),
        (false, _) => magnitude.to_string(),
    }
}

/// Formats a number into a fixed-width ASCII header field, dropping
/// decimals until it fits.
pub fn format_number_field(value: f64, width: usize) -> Result<String> {
    if !value.is_finite() {
        return Err(EdfError::InvalidFormat(format!("{} is not a finite number", value)));
    }

    let plain = format!("{}", value);
    if plain.len() <= width {
        return Ok(format!("{:<width$}", plain, width = width));
    }

    for decimals in (0..width).rev() {
        let text = format!("{:.*}", decimals, value);
        let text = if text.contains('.') {
            text.trim_end_matches('0').trim_end_matches('.').to_string()
        } else {
            text
        };
        if text.len() <= width {
            return Ok(format!("{:<width$}", text, width = width));
        }
    }

    Err(EdfError::InvalidFormat(format!("{} does not fit into {} characters", value, width)))
}

/// Left-aligned, space-padded field; non-ASCII characters become `_` and
/// overlong text is cut at `width`.
pub fn pad_field(text: &str, width: usize) -> Vec<u8> {
    let mut field = vec![b' '; width];
    for (slot, byte) in field.iter_mut().zip(to_ascii(text).bytes()) {
        *slot = byte;
    }
    field
}

// 工具函数：将字符串转换为 7-bit ASCII，非 ASCII 替换为 '_'
fn to_ascii(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii() && !c.is_ascii_control() { c } else { '_' })
        .collect()
}

/// Extracts the frequency of a `LP:70Hz`-style tag from prefilter text.
pub fn parse_prefilter_tag(text: &str, tag: &str) -> Option<f64> {
    let upper = text.to_ascii_uppercase();
    let start = upper.find(tag)? + tag.len();
    let rest = &upper[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let value: f64 = rest[..end].parse().ok()?;

    if rest[end..].starts_with("KHZ") {
        Some(value * 1000.0)
    } else {
        Some(value)
    }
}
