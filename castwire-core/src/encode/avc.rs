//! H.264 bitstream helpers for FLV
//!
//! Encoders emit Annex B (start-code delimited) NAL units; FLV carries
//! length-prefixed NAL units and an AVCDecoderConfigurationRecord.

use bytes::{BufMut, Bytes, BytesMut};

const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

/// Split an Annex B buffer into NAL units (without start codes)
pub fn split_annexb(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut i = 0;
    let mut start: Option<usize> = None;
    while i + 3 <= data.len() {
        let code_len = if data[i..].starts_with(&[0, 0, 1]) {
            3
        } else if data[i..].starts_with(&[0, 0, 0, 1]) {
            4
        } else {
            0
        };
        if code_len > 0 {
            if let Some(s) = start {
                nals.push(trim_trailing_zeros(&data[s..i]));
            }
            i += code_len;
            start = Some(i);
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if s < data.len() {
            nals.push(&data[s..]);
        }
    }
    nals.retain(|nal| !nal.is_empty());
    nals
}

fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let end = nal.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
    &nal[..end]
}

/// Convert Annex B NAL units to 4-byte length-prefixed form
///
/// Parameter sets are dropped; they travel in the sequence header.
pub fn annexb_to_avcc(data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 16);
    for nal in split_annexb(data) {
        let kind = nal[0] & 0x1f;
        if kind == NAL_SPS || kind == NAL_PPS {
            continue;
        }
        out.put_u32(nal.len() as u32);
        out.extend_from_slice(nal);
    }
    out.freeze()
}

/// Build an AVCDecoderConfigurationRecord from Annex B parameter sets
///
/// Returns `None` unless both an SPS and a PPS are present.
pub fn decoder_config(extradata: &[u8]) -> Option<Bytes> {
    let nals = split_annexb(extradata);
    let sps = nals.iter().find(|n| n[0] & 0x1f == NAL_SPS)?;
    let pps = nals.iter().find(|n| n[0] & 0x1f == NAL_PPS)?;
    if sps.len() < 4 {
        return None;
    }

    let mut out = BytesMut::with_capacity(11 + sps.len() + pps.len());
    out.put_u8(1); // configurationVersion
    out.put_u8(sps[1]); // AVCProfileIndication
    out.put_u8(sps[2]); // profile_compatibility
    out.put_u8(sps[3]); // AVCLevelIndication
    out.put_u8(0xff); // 4-byte NAL lengths
    out.put_u8(0xe1); // one SPS
    out.put_u16(sps.len() as u16);
    out.extend_from_slice(sps);
    out.put_u8(1); // one PPS
    out.put_u16(pps.len() as u16);
    out.extend_from_slice(pps);
    Some(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1f, 0xda];
    const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84];

    fn annexb(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn test_split_handles_both_start_codes() {
        let mut data = annexb(&[SPS]);
        data.extend_from_slice(&[0, 0, 1]);
        data.extend_from_slice(PPS);
        assert_eq!(split_annexb(&data), vec![SPS, PPS]);
    }

    #[test]
    fn test_avcc_strips_parameter_sets() {
        let out = annexb_to_avcc(&annexb(&[SPS, PPS, IDR]));
        assert_eq!(&out[..], &[0, 0, 0, 3, 0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_decoder_config_record() {
        let record = decoder_config(&annexb(&[SPS, PPS])).unwrap();
        assert_eq!(&record[..6], &[1, 0x42, 0xc0, 0x1f, 0xff, 0xe1]);
        assert_eq!(&record[6..8], &[0, 5]);
        assert_eq!(record.len(), 11 + SPS.len() + PPS.len());
        assert!(decoder_config(&annexb(&[SPS])).is_none());
    }
}
