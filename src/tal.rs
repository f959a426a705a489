//! Time-stamped Annotations Lists (TAL).
//!
//! Every annotation channel of a data record holds a sequence of TALs:
//!
//! ```text
//! +<onset>[\x15<duration>]\x14[<text>\x14]*\x00
//! ```
//!
//! padded with `\x00` up to the channel's byte size. The first TAL of the
//! first annotation channel is the time-keeping TAL: its first text is empty
//! and its onset is the onset of the data record.

use std::ops::Range;

use crate::error::{EdfError, Result};
use crate::types::{Annotation, AnnotationBlock};
use crate::utils::{format_tal_time, parse_tal_time};

/// Separates onset from texts and terminates every text.
pub const TAL_TEXT_SEPARATOR: u8 = 0x14;
/// Separates onset from duration.
pub const TAL_DURATION_SEPARATOR: u8 = 0x15;
/// Terminates a TAL; also used as padding.
pub const TAL_TERMINATOR: u8 = 0x00;

/// One decoded TAL.
#[derive(Debug, Clone, PartialEq)]
pub struct Tal {
    pub onset: f64,
    pub duration: Option<f64>,
    pub texts: Vec<String>,
}

/// Decodes all TALs of one annotation channel region.
pub fn decode(region: &[u8]) -> Result<Vec<Tal>> {
    region
        .split(|&b| b == TAL_TERMINATOR)
        .filter(|segment| !segment.is_empty())
        .map(decode_one)
        .collect()
}

fn decode_one(segment: &[u8]) -> Result<Tal> {
    let malformed = || EdfError::TalDecode(format!("malformed TAL {:?}", String::from_utf8_lossy(segment)));

    if segment.last() != Some(&TAL_TEXT_SEPARATOR) {
        return Err(malformed());
    }
    let head_end = segment
        .iter()
        .position(|&b| b == TAL_TEXT_SEPARATOR)
        .ok_or_else(malformed)?;
    if head_end + 1 > segment.len() - 1 {
        return Err(malformed());
    }

    let head = std::str::from_utf8(&segment[..head_end]).map_err(|_| malformed())?;
    let (onset, duration) = match head.split_once(TAL_DURATION_SEPARATOR as char) {
        Some((onset, duration)) => (onset, Some(duration)),
        None => (head, None),
    };
    let onset = parse_tal_time(onset, true)?;
    let duration = duration.map(|d| parse_tal_time(d, false)).transpose()?;

    let body = &segment[head_end + 1..segment.len() - 1];
    let texts = body
        .split(|&b| b == TAL_TEXT_SEPARATOR)
        .map(|text| String::from_utf8_lossy(text).into_owned())
        .collect();

    Ok(Tal { onset, duration, texts })
}

/// Encodes one TAL including its terminator.
pub fn encode(onset: f64, duration: Option<f64>, texts: &[String]) -> Vec<u8> {
    let mut tal = format_tal_time(onset, true).into_bytes();
    if let Some(duration) = duration {
        tal.push(TAL_DURATION_SEPARATOR);
        tal.extend_from_slice(format_tal_time(duration, false).as_bytes());
    }
    tal.push(TAL_TEXT_SEPARATOR);
    for text in texts {
        tal.extend_from_slice(text.as_bytes());
        tal.push(TAL_TEXT_SEPARATOR);
    }
    tal.push(TAL_TERMINATOR);
    tal
}

/// The record time-keeping TAL, `+<onset>\x14\x14\x00`.
pub fn encode_time_keeping(onset: f64) -> Vec<u8> {
    encode(onset, None, &[String::new()])
}

fn encoded_len(annotation: &Annotation) -> usize {
    encode(annotation.onset, annotation.duration, &annotation.texts).len()
}

impl AnnotationBlock {
    /// Decodes every annotation channel of a raw record into a new block.
    /// `ranges` are the byte ranges of the channels, in channel order.
    pub fn from_record(record: usize, buffer: &[u8], ranges: &[Range<usize>]) -> Result<Self> {
        let mut block = AnnotationBlock::placeholder(record);
        for (channel, range) in ranges.iter().enumerate() {
            block.read_from_buffer(buffer, range.start, range.len(), channel)?;
        }
        Ok(block)
    }

    /// Decodes annotation channel `channel` from `buffer[byte_offset..byte_offset + byte_count]`,
    /// replacing whatever the block held for that channel.
    ///
    /// Channel 0 must start with the time-keeping TAL, which sets the block onset.
    /// The block is left untouched when decoding fails.
    pub fn read_from_buffer(
        &mut self,
        buffer: &[u8],
        byte_offset: usize,
        byte_count: usize,
        channel: usize,
    ) -> Result<()> {
        let region = region(buffer, byte_offset, byte_count)?;
        let mut tals = decode(region)?.into_iter();

        let mut onset = self.onset;
        let mut decoded = Vec::new();
        if channel == 0 {
            let time_keeping = tals
                .next()
                .filter(|tal| tal.texts.first().map_or(false, |text| text.is_empty()))
                .ok_or_else(|| EdfError::TalDecode(format!(
                    "record {} has no time-keeping annotation", self.record
                )))?;
            onset = time_keeping.onset;
            let texts: Vec<String> = time_keeping.texts.into_iter().filter(|t| !t.is_empty()).collect();
            if !texts.is_empty() {
                decoded.push(Annotation {
                    onset: time_keeping.onset,
                    duration: time_keeping.duration,
                    texts,
                    channel,
                });
            }
        }

        for tal in tals {
            let texts: Vec<String> = tal.texts.into_iter().filter(|t| !t.is_empty()).collect();
            if texts.is_empty() {
                continue;
            }
            decoded.push(Annotation {
                onset: tal.onset,
                duration: tal.duration,
                texts,
                channel,
            });
        }

        self.onset = onset;
        self.annotations.retain(|annotation| annotation.channel != channel);
        self.annotations.extend(decoded);
        Ok(())
    }

    /// Encodes the annotations assigned to `channel` into
    /// `buffer[byte_offset..byte_offset + byte_count]`, padding with zeros.
    pub fn write_to_buffer(
        &self,
        buffer: &mut [u8],
        byte_offset: usize,
        byte_count: usize,
        channel: usize,
    ) -> Result<()> {
        if !self.onset.is_finite() {
            return Err(EdfError::InvalidArgument(format!(
                "annotation block {} has no onset", self.record
            )));
        }
        if let Some(bad) = self.annotations.iter().find(|a| !a.is_finite()) {
            return Err(EdfError::InvalidArgument(format!(
                "annotation at {} in block {} is not a finite time", bad.onset, self.record
            )));
        }

        let mut encoded = Vec::with_capacity(byte_count);
        if channel == 0 {
            encoded.extend(encode_time_keeping(self.onset));
        }
        for annotation in self.annotations.iter().filter(|a| a.channel == channel) {
            encoded.extend(encode(annotation.onset, annotation.duration, &annotation.texts));
        }
        if encoded.len() > byte_count {
            return Err(EdfError::AnnotationOverflow { record: self.record, channel });
        }

        let region = region_mut(buffer, byte_offset, byte_count)?;
        region[..encoded.len()].copy_from_slice(&encoded);
        region[encoded.len()..].fill(TAL_TERMINATOR);
        Ok(())
    }

    /// Bytes needed to store the whole block in a single annotation channel.
    pub fn required_bytes(&self) -> usize {
        let time_keeping = if self.is_decoded() {
            encode_time_keeping(self.onset).len()
        } else {
            encode_time_keeping(0.0).len()
        };
        time_keeping + self.annotations.iter().map(encoded_len).sum::<usize>()
    }

    /// Assigns annotations to channels in onset order so each channel's TALs fit
    /// its capacity. Channel 0 also carries the time-keeping TAL.
    pub fn balance_channels(&mut self, capacities: &[usize]) -> Result<()> {
        if capacities.is_empty() {
            return Err(EdfError::InvalidArgument("no annotation channels".to_string()));
        }
        let mut used = vec![0usize; capacities.len()];
        used[0] = encode_time_keeping(if self.is_decoded() { self.onset } else { 0.0 }).len();
        if used[0] > capacities[0] {
            return Err(EdfError::AnnotationOverflow { record: self.record, channel: 0 });
        }

        self.annotations.sort_by(|a, b| a.onset.total_cmp(&b.onset));
        let mut assignment = Vec::with_capacity(self.annotations.len());
        for annotation in &self.annotations {
            let len = encoded_len(annotation);
            let channel = (0..capacities.len())
                .find(|&c| used[c] + len <= capacities[c])
                .ok_or(EdfError::AnnotationOverflow {
                    record: self.record,
                    channel: capacities.len() - 1,
                })?;
            used[channel] += len;
            assignment.push(channel);
        }

        for (annotation, channel) in self.annotations.iter_mut().zip(assignment) {
            if annotation.channel != channel {
                annotation.channel = channel;
                self.modified = true;
            }
        }
        Ok(())
    }
}

fn region(buffer: &[u8], byte_offset: usize, byte_count: usize) -> Result<&[u8]> {
    byte_offset
        .checked_add(byte_count)
        .and_then(|end| buffer.get(byte_offset..end))
        .ok_or_else(|| EdfError::InvalidArgument(format!(
            "region {}+{} outside buffer of {} bytes", byte_offset, byte_count, buffer.len()
        )))
}

fn region_mut(buffer: &mut [u8], byte_offset: usize, byte_count: usize) -> Result<&mut [u8]> {
    let len = buffer.len();
    byte_offset
        .checked_add(byte_count)
        .and_then(move |end| buffer.get_mut(byte_offset..end))
        .ok_or_else(|| EdfError::InvalidArgument(format!(
            "region {}+{} outside buffer of {} bytes", byte_offset, byte_count, len
        )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_bytes(parts: &[&[u8]], size: usize) -> Vec<u8> {
        let mut bytes: Vec<u8> = parts.concat();
        bytes.resize(size, 0);
        bytes
    }

    #[test]
    fn test_decode_record_with_annotations() {
        let bytes = channel_bytes(
            &[b"+12.5\x14\x14\x00", b"+13\x151.5\x14Spindle\x14\x00", b"+14\x14Arousal\x14Snore\x14\x00"],
            80,
        );
        let mut block = AnnotationBlock::placeholder(3);
        block.read_from_buffer(&bytes, 0, bytes.len(), 0).unwrap();

        assert_eq!(block.onset, 12.5);
        assert_eq!(block.annotations.len(), 2);
        assert_eq!(block.annotations[0].onset, 13.0);
        assert_eq!(block.annotations[0].duration, Some(1.5));
        assert_eq!(block.annotations[0].texts, vec!["Spindle".to_string()]);
        assert_eq!(block.annotations[1].texts, vec!["Arousal".to_string(), "Snore".to_string()]);
    }

    #[test]
    fn test_time_keeping_with_text() {
        let bytes = channel_bytes(&[b"+0\x14\x14Recording starts\x14\x00"], 40);
        let mut block = AnnotationBlock::placeholder(0);
        block.read_from_buffer(&bytes, 0, 40, 0).unwrap();
        assert_eq!(block.onset, 0.0);
        assert_eq!(block.annotations[0].texts, vec!["Recording starts".to_string()]);
    }

    #[test]
    fn test_malformed_region_leaves_block_untouched() {
        let mut block = AnnotationBlock::placeholder(1);

        let garbage = channel_bytes(&[b"12\x14\x14\x00"], 20);
        assert!(matches!(block.read_from_buffer(&garbage, 0, 20, 0), Err(EdfError::TalDecode(_))));

        let zeros = vec![0u8; 20];
        assert!(matches!(block.read_from_buffer(&zeros, 0, 20, 0), Err(EdfError::TalDecode(_))));

        let unterminated = channel_bytes(&[b"+1\x14\x14Text"], 20);
        assert!(block.read_from_buffer(&unterminated, 0, 20, 0).is_err());

        assert!(block.onset.is_nan());
        assert!(block.annotations.is_empty());
    }

    #[test]
    fn test_write_then_read_back_two_channels() {
        let mut block = AnnotationBlock::new(7, 7.0);
        block.annotations.push(Annotation::new(7.25, None, "Eyes closed"));
        let mut second = Annotation::new(7.5, Some(0.5), "Artifact");
        second.channel = 1;
        block.annotations.push(second);

        let mut record = vec![0xAAu8; 10 + 40 + 40];
        block.write_to_buffer(&mut record, 10, 40, 0).unwrap();
        block.write_to_buffer(&mut record, 50, 40, 1).unwrap();
        assert!(record[..10].iter().all(|&b| b == 0xAA));
        assert_eq!(&record[10..19], b"+7\x14\x14\x00+7.2");

        let mut decoded = AnnotationBlock::placeholder(7);
        decoded.read_from_buffer(&record, 10, 40, 0).unwrap();
        decoded.read_from_buffer(&record, 50, 40, 1).unwrap();
        assert_eq!(decoded.onset, 7.0);
        assert_eq!(decoded.annotations, block.annotations);
    }

    #[test]
    fn test_overflow_and_balance() {
        let mut block = AnnotationBlock::new(0, 0.0);
        block.annotations.push(Annotation::new(0.5, None, "first event"));
        block.annotations.push(Annotation::new(0.75, None, "second event"));

        let mut record = vec![0u8; 60];
        assert!(matches!(
            block.write_to_buffer(&mut record, 0, 30, 0),
            Err(EdfError::AnnotationOverflow { record: 0, channel: 0 })
        ));
        assert!(block.required_bytes() > 30);

        block.balance_channels(&[30, 30]).unwrap();
        assert_eq!(block.annotations[0].channel, 0);
        assert_eq!(block.annotations[1].channel, 1);
        assert!(block.modified);
        block.write_to_buffer(&mut record, 0, 30, 0).unwrap();
        block.write_to_buffer(&mut record, 30, 30, 1).unwrap();

        assert!(block.balance_channels(&[10]).is_err());
    }

    #[test]
    fn test_from_record_needs_every_channel() {
        let mut block = AnnotationBlock::new(2, 2.0);
        block.annotations.push(Annotation::new(2.5, None, "Blink"));
        let mut record = vec![0u8; 60];
        block.write_to_buffer(&mut record, 0, 30, 0).unwrap();
        block.write_to_buffer(&mut record, 30, 30, 1).unwrap();

        let decoded = AnnotationBlock::from_record(2, &record, &[0..30, 30..60]).unwrap();
        assert_eq!(decoded.onset, 2.0);
        assert_eq!(decoded.annotations, block.annotations);

        record[30..35].copy_from_slice(b"junk!");
        assert!(matches!(
            AnnotationBlock::from_record(2, &record, &[0..30, 30..60]),
            Err(EdfError::TalDecode(_))
        ));
    }

    #[test]
    fn test_non_finite_times_are_not_encoded() {
        let mut record = vec![0u8; 40];
        let mut block = AnnotationBlock::new(0, f64::INFINITY);
        assert!(matches!(
            block.write_to_buffer(&mut record, 0, 40, 0),
            Err(EdfError::InvalidArgument(_))
        ));

        block.onset = 0.0;
        block.annotations.push(Annotation::new(0.5, Some(f64::NAN), "bad"));
        assert!(matches!(
            block.write_to_buffer(&mut record, 0, 40, 0),
            Err(EdfError::InvalidArgument(_))
        ));
        assert!(record.iter().all(|&b| b == 0));
    }
}
