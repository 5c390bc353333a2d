//! The waveform preamble (`:WAV:PRE?`) is a packed little endian record describing the
//! scaling and addressing of the most recent acquisition.
//!
//! Only the first [`PREAMBLE_LENGTH`] bytes are interpreted. In sequence mode the instrument
//! appends undocumented bytes (presumably frame time stamps) which are ignored. Fields named
//! `reserved*` are decoded to keep the offsets aligned but are not exposed.

use std::collections::BTreeMap;

use anyhow::anyhow;
use byteorder::{ByteOrder, LittleEndian};

use crate::Error;

pub const PREAMBLE_LENGTH: usize = 346;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// Fixed width, NUL padded byte string.
    Text(usize),
    U16,
    I32,
    F32,
    F64,
}

impl FieldKind {
    pub const fn width(&self) -> usize {
        match self {
            FieldKind::Text(n) => *n,
            FieldKind::U16 => 2,
            FieldKind::I32 => 4,
            FieldKind::F32 => 4,
            FieldKind::F64 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Field {
    pub name: &'static str,
    pub kind: FieldKind,
}

impl Field {
    pub fn is_reserved(&self) -> bool {
        self.name.starts_with("reserved")
    }
}

const fn field(name: &'static str, kind: FieldKind) -> Field {
    Field { name, kind }
}

use FieldKind::{Text, F32, F64, I32, U16};

/// Field layout in wire order. Offsets follow from the widths.
pub const WAVE_DESCRIPTOR: &[Field] = &[
    field("descriptor_name", Text(16)),
    field("reserved_template_name", Text(16)),
    field("reserved_comm_type", U16),
    field("reserved_comm_order", U16),
    field("reserved_wave_descriptor_length", I32),
    field("reserved_user_text_length", I32),
    field("reserved_res_desc1", I32),
    field("reserved_trigtime_array_length", I32),
    field("reserved_ris_time_array_length", I32),
    field("reserved_res_array1", I32),
    field("reserved_wave_array_1_length", I32),
    field("reserved_wave_array_2_length", I32),
    field("reserved_res_array2", I32),
    field("reserved_res_array3", I32),
    field("instrument_name", Text(16)),
    field("reserved_instrument_number", I32),
    field("reserved_trace_label", Text(16)),
    field("reserved_1", U16),
    field("reserved_2", U16),
    field("wave_array_max", I32),
    field("reserved_points_per_screen", I32),
    field("reserved_first_valid_point", I32),
    field("reserved_last_valid_point", I32),
    field("wave_array_start", I32),
    field("wave_array_interval", I32),
    field("frames_index", I32),
    field("frames_read", I32),
    field("frames_sum", I32),
    field("reserved_points_per_pair", U16),
    field("reserved_pair_offset", U16),
    field("vertical_gain", F32),
    field("vertical_offset", F32),
    field("code_per_div", F32),
    field("reserved_min_value", F32),
    field("reserved_adc_bits", U16),
    field("reserved_nom_subarray_count", U16),
    field("horizontal_interval", F32),
    field("horizontal_offset", F64),
    field("reserved_pixel_offset", F64),
    field("reserved_vertical_unit", Text(48)),
    field("reserved_horizontal_unit", Text(48)),
    field("reserved_horiz_uncertainty", F32),
    field("reserved_trigger_time", Text(16)),
    field("reserved_acq_duration", F32),
    field("reserved_record_type", U16),
    field("reserved_processing_done", U16),
    field("reserved_3", U16),
    field("reserved_ris_sweeps", U16),
    field("time_base", U16),
    field("reserved_vert_coupling", U16),
    field("probe_attenuation", F32),
    field("reserved_fixed_vert_gain", U16),
    field("bandwidth_limit", U16),
    field("reserved_vertical_vernier", F32),
    field("reserved_acq_vert_offset", F32),
    field("wave_source", U16),
];

/// Iterate over the layout together with the byte offset of each field.
pub fn layout() -> impl Iterator<Item = (usize, &'static Field)> {
    WAVE_DESCRIPTOR.iter().scan(0, |offset, field| {
        let ret = (*offset, field);
        *offset += field.kind.width();
        Some(ret)
    })
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Text(String),
    U16(u16),
    I32(i32),
    F32(f32),
    F64(f64),
}

/// The non-reserved fields of a decoded preamble, as they appear on the wire.
///
/// Lookup table translation (time base, source) happens in
/// [`WaveformParameters`](crate::params::WaveformParameters).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Preamble {
    fields: BTreeMap<&'static str, FieldValue>,
}

impl Preamble {
    pub fn decode(data: &[u8]) -> crate::Result<Self> {
        if data.len() < PREAMBLE_LENGTH {
            return Err(Error::interpretation(anyhow!(
                "Waveform preamble too short: {} bytes, expected {}",
                data.len(),
                PREAMBLE_LENGTH
            )));
        }
        let mut fields = BTreeMap::new();
        for (offset, field) in layout() {
            let raw = &data[offset..offset + field.kind.width()];
            if field.is_reserved() {
                continue;
            }
            let value = match field.kind {
                Text(_) => {
                    let end = raw.iter().rposition(|x| *x != 0).map(|x| x + 1).unwrap_or(0);
                    FieldValue::Text(String::from_utf8_lossy(&raw[..end]).to_string())
                }
                U16 => FieldValue::U16(LittleEndian::read_u16(raw)),
                I32 => FieldValue::I32(LittleEndian::read_i32(raw)),
                F32 => FieldValue::F32(LittleEndian::read_f32(raw)),
                F64 => FieldValue::F64(LittleEndian::read_f64(raw)),
            };
            fields.insert(field.name, value);
        }
        Ok(Preamble { fields })
    }

    /// Serialize into the wire layout. Fields which are not set, as well as reserved fields,
    /// are zero filled. Used by simulated instruments.
    pub fn encode(&self) -> Vec<u8> {
        let mut ret = vec![0_u8; PREAMBLE_LENGTH];
        for (offset, field) in layout() {
            let out = &mut ret[offset..offset + field.kind.width()];
            match (field.kind, self.fields.get(field.name)) {
                (Text(n), Some(FieldValue::Text(x))) => {
                    let bytes = x.as_bytes();
                    let len = bytes.len().min(n);
                    out[..len].copy_from_slice(&bytes[..len]);
                }
                (U16, Some(FieldValue::U16(x))) => LittleEndian::write_u16(out, *x),
                (I32, Some(FieldValue::I32(x))) => LittleEndian::write_i32(out, *x),
                (F32, Some(FieldValue::F32(x))) => LittleEndian::write_f32(out, *x),
                (F64, Some(FieldValue::F64(x))) => LittleEndian::write_f64(out, *x),
                _ => {}
            }
        }
        ret
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Set a field. Fails if the name is unknown, reserved, or the value has the wrong type.
    pub fn set(&mut self, name: &str, value: FieldValue) -> crate::Result<&mut Self> {
        let field = WAVE_DESCRIPTOR
            .iter()
            .find(|x| x.name == name && !x.is_reserved())
            .ok_or_else(|| Error::argument(anyhow!("Unknown preamble field `{}`", name)))?;
        let matching = matches!(
            (field.kind, &value),
            (Text(_), FieldValue::Text(_))
                | (U16, FieldValue::U16(_))
                | (I32, FieldValue::I32(_))
                | (F32, FieldValue::F32(_))
                | (F64, FieldValue::F64(_))
        );
        if !matching {
            return Err(Error::argument(anyhow!("Wrong type for preamble field `{}`", name)));
        }
        self.fields.insert(field.name, value);
        Ok(self)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.keys().copied()
    }

    pub fn text(&self, name: &str) -> crate::Result<String> {
        match self.require(name)? {
            FieldValue::Text(x) => Ok(x.clone()),
            _ => Err(wrong_type(name)),
        }
    }

    pub fn u16(&self, name: &str) -> crate::Result<u16> {
        match self.require(name)? {
            FieldValue::U16(x) => Ok(*x),
            _ => Err(wrong_type(name)),
        }
    }

    pub fn i32(&self, name: &str) -> crate::Result<i32> {
        match self.require(name)? {
            FieldValue::I32(x) => Ok(*x),
            _ => Err(wrong_type(name)),
        }
    }

    pub fn f32(&self, name: &str) -> crate::Result<f32> {
        match self.require(name)? {
            FieldValue::F32(x) => Ok(*x),
            _ => Err(wrong_type(name)),
        }
    }

    pub fn f64(&self, name: &str) -> crate::Result<f64> {
        match self.require(name)? {
            FieldValue::F64(x) => Ok(*x),
            _ => Err(wrong_type(name)),
        }
    }

    fn require(&self, name: &str) -> crate::Result<&FieldValue> {
        self.fields
            .get(name)
            .ok_or_else(|| Error::interpretation(anyhow!("Missing preamble field `{}`", name)))
    }
}

fn wrong_type(name: &str) -> Error {
    Error::interpretation(anyhow!("Preamble field `{}` has unexpected type", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offset_of(name: &str) -> usize {
        layout().find(|(_, f)| f.name == name).unwrap().0
    }

    #[test]
    fn layout_offsets() {
        let total: usize = WAVE_DESCRIPTOR.iter().map(|x| x.kind.width()).sum();
        assert_eq!(total, PREAMBLE_LENGTH);
        assert_eq!(offset_of("instrument_name"), 76);
        assert_eq!(offset_of("wave_array_max"), 116);
        assert_eq!(offset_of("wave_array_start"), 132);
        assert_eq!(offset_of("frames_sum"), 148);
        assert_eq!(offset_of("vertical_gain"), 156);
        assert_eq!(offset_of("code_per_div"), 164);
        assert_eq!(offset_of("horizontal_interval"), 176);
        assert_eq!(offset_of("horizontal_offset"), 180);
        assert_eq!(offset_of("time_base"), 324);
        assert_eq!(offset_of("probe_attenuation"), 328);
        assert_eq!(offset_of("bandwidth_limit"), 334);
        assert_eq!(offset_of("wave_source"), 344);
    }

    #[test]
    fn decode_raw_bytes() {
        let mut data = vec![0_u8; PREAMBLE_LENGTH + 16];
        data[0..8].copy_from_slice(b"WAVEDESC");
        LittleEndian::write_i32(&mut data[116..], 1_000_000);
        LittleEndian::write_f32(&mut data[156..], 0.5);
        LittleEndian::write_f64(&mut data[180..], -1.25e-3);
        LittleEndian::write_u16(&mut data[324..], 11);
        // trailing sequence mode junk
        for x in data[PREAMBLE_LENGTH..].iter_mut() {
            *x = 0xAA;
        }

        let preamble = Preamble::decode(&data).unwrap();
        assert_eq!(preamble.text("descriptor_name").unwrap(), "WAVEDESC");
        assert_eq!(preamble.i32("wave_array_max").unwrap(), 1_000_000);
        assert_eq!(preamble.f32("vertical_gain").unwrap(), 0.5);
        assert_eq!(preamble.f64("horizontal_offset").unwrap(), -1.25e-3);
        assert_eq!(preamble.u16("time_base").unwrap(), 11);
        assert!(preamble.get("reserved_template_name").is_none());
        assert!(preamble.names().all(|x| !x.starts_with("reserved")));
    }

    #[test]
    fn too_short() {
        let ret = Preamble::decode(&[0_u8; 100]);
        assert!(matches!(ret, Err(Error::Interpretation(_))));
    }

    #[test]
    fn set_checks_type() {
        let mut preamble = Preamble::default();
        assert!(preamble.set("vertical_gain", FieldValue::F32(1.0)).is_ok());
        assert!(preamble.set("vertical_gain", FieldValue::I32(1)).is_err());
        assert!(preamble.set("reserved_1", FieldValue::U16(1)).is_err());
        assert!(preamble.set("no_such_field", FieldValue::U16(1)).is_err());
    }

    #[test]
    fn encode_decode() {
        let mut preamble = Preamble::default();
        preamble
            .set("descriptor_name", FieldValue::Text("WAVEDESC".to_string()))
            .unwrap()
            .set("frames_read", FieldValue::I32(3))
            .unwrap()
            .set("probe_attenuation", FieldValue::F32(10.0))
            .unwrap();
        let data = preamble.encode();
        assert_eq!(data.len(), PREAMBLE_LENGTH);
        let decoded = Preamble::decode(&data).unwrap();
        assert_eq!(decoded.text("descriptor_name").unwrap(), "WAVEDESC");
        assert_eq!(decoded.i32("frames_read").unwrap(), 3);
        assert_eq!(decoded.f32("probe_attenuation").unwrap(), 10.0);
        // unset fields come back as zero
        assert_eq!(decoded.i32("frames_sum").unwrap(), 0);
        assert_eq!(decoded.text("instrument_name").unwrap(), "");
    }
}
