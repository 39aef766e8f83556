//! DV (MRC-compatible) file header.
//!
//! A DV file is a 1024-byte little-endian base header, an extended header
//! holding `NumIntegers` i32 and `NumFloats` f32 values per plane, then the
//! image planes. Only the fields the saver fills in are modelled; the rest are
//! written with the customary defaults.

use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use cockpit_core::{CockpitError, CockpitResult};

pub const HEADER_BYTES: u64 = 1024;
pub const EXT_INTS: usize = 8;
pub const EXT_FLOATS: usize = 32;
/// Extended header bytes per plane.
pub const EXT_BYTES_PER_PLANE: u64 = 4 * (EXT_INTS + EXT_FLOATS) as u64;
pub const MAX_TITLES: usize = 10;
pub const TITLE_LEN: usize = 80;

/// MRC mode for unsigned 16-bit pixels.
pub const PIXEL_TYPE_U16: i32 = 6;
/// Wavelength fastest, then Z, then time.
pub const IMG_SEQUENCE_WZT: i16 = 1;

const DVID: u16 = 0xc0a0;

#[derive(Debug, Clone, PartialEq)]
pub struct DvHeader {
    /// Width, height, and number of planes.
    pub num: [i32; 3],
    pub pixel_type: i32,
    /// Pixel spacing in µm (x, y, z).
    pub pixel_size: [f32; 3],
    /// Min, max and mean of the first wavelength.
    pub mmm1: [f32; 3],
    /// Extended header size in bytes.
    pub next: i32,
    pub num_integers: i16,
    pub num_floats: i16,
    /// Min and max of wavelengths two to five.
    pub mm: [[f32; 2]; 4],
    pub lens_num: i16,
    pub num_times: i16,
    pub img_sequence: i16,
    pub num_waves: i16,
    pub wave: [i16; 5],
    pub titles: Vec<String>,
}

impl DvHeader {
    /// Header for `waves * times * zs` planes of `width * height` u16 pixels.
    #[allow(clippy::too_many_arguments)]
    pub fn for_shape(
        waves: usize,
        times: usize,
        zs: usize,
        height: u32,
        width: u32,
        pixel_size_xy: f32,
        pixel_size_z: f32,
        wavelengths: &[Option<f64>],
    ) -> Self {
        let mut wave = [0i16; 5];
        for (slot, wl) in wave.iter_mut().zip(wavelengths) {
            *slot = wl.map_or(0, |w| w.round() as i16);
        }
        Self {
            num: [width as i32, height as i32, (waves * times * zs) as i32],
            pixel_type: PIXEL_TYPE_U16,
            pixel_size: [pixel_size_xy, pixel_size_xy, pixel_size_z],
            mmm1: [0.0, 100_000.0, 5000.0],
            next: 0,
            num_integers: 0,
            num_floats: 0,
            mm: [[0.0, 10_000.0]; 4],
            lens_num: 0,
            num_times: times as i16,
            img_sequence: IMG_SEQUENCE_WZT,
            num_waves: waves as i16,
            wave,
            titles: Vec::new(),
        }
    }

    pub fn set_titles(&mut self, titles: &[String]) -> CockpitResult<()> {
        if titles.len() > MAX_TITLES {
            return Err(CockpitError::TitlesOverflow {
                count: titles.len(),
                lines: titles.join("\n"),
            });
        }
        if let Some(long) = titles.iter().find(|t| t.len() > TITLE_LEN) {
            return Err(CockpitError::Configuration(format!(
                "title longer than {TITLE_LEN} bytes: {long}"
            )));
        }
        self.titles = titles.to_vec();
        Ok(())
    }

    /// Record the intensity range of one wavelength. Only the first five
    /// wavelengths have header slots.
    pub fn set_min_max(&mut self, wave_index: usize, min: f32, max: f32) {
        match wave_index {
            0 => self.mmm1 = [min, max, 0.0],
            1..=4 => self.mm[wave_index - 1] = [min, max],
            _ => {}
        }
    }

    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(HEADER_BYTES as usize);
        for v in self.num {
            out.write_i32::<LittleEndian>(v)?;
        }
        out.write_i32::<LittleEndian>(self.pixel_type)?;
        // mst
        for _ in 0..3 {
            out.write_i32::<LittleEndian>(0)?;
        }
        // m
        for _ in 0..3 {
            out.write_i32::<LittleEndian>(1)?;
        }
        for v in self.pixel_size {
            out.write_f32::<LittleEndian>(v)?;
        }
        // angle
        for _ in 0..3 {
            out.write_f32::<LittleEndian>(90.0)?;
        }
        // axis
        for v in [1, 2, 3] {
            out.write_i32::<LittleEndian>(v)?;
        }
        for v in self.mmm1 {
            out.write_f32::<LittleEndian>(v)?;
        }
        out.write_i16::<LittleEndian>(0)?; // type
        out.write_i16::<LittleEndian>(0)?; // nspg
        out.write_i32::<LittleEndian>(self.next)?;
        out.write_u16::<LittleEndian>(DVID)?;
        out.write_all(&[0u8; 30])?;
        out.write_i16::<LittleEndian>(self.num_integers)?;
        out.write_i16::<LittleEndian>(self.num_floats)?;
        out.write_i16::<LittleEndian>(0)?; // sub
        out.write_i16::<LittleEndian>(0)?; // zfac
        for pair in &self.mm[..3] {
            for v in pair {
                out.write_f32::<LittleEndian>(*v)?;
            }
        }
        out.write_i16::<LittleEndian>(0)?; // image type
        out.write_i16::<LittleEndian>(self.lens_num)?;
        for _ in 0..4 {
            out.write_i16::<LittleEndian>(0)?; // n1 n2 v1 v2
        }
        for v in self.mm[3] {
            out.write_f32::<LittleEndian>(v)?;
        }
        out.write_i16::<LittleEndian>(self.num_times)?;
        out.write_i16::<LittleEndian>(self.img_sequence)?;
        // tilt
        for _ in 0..3 {
            out.write_f32::<LittleEndian>(0.0)?;
        }
        out.write_i16::<LittleEndian>(self.num_waves)?;
        for v in self.wave {
            out.write_i16::<LittleEndian>(v)?;
        }
        // zxy0
        for _ in 0..3 {
            out.write_f32::<LittleEndian>(0.0)?;
        }
        out.write_i32::<LittleEndian>(self.titles.len() as i32)?;
        for i in 0..MAX_TITLES {
            let mut field = [0u8; TITLE_LEN];
            if let Some(title) = self.titles.get(i) {
                let bytes = title.as_bytes();
                let n = bytes.len().min(TITLE_LEN);
                field[..n].copy_from_slice(&bytes[..n]);
            }
            out.write_all(&field)?;
        }
        debug_assert_eq!(out.len() as u64, HEADER_BYTES);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        if (bytes.len() as u64) < HEADER_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "DV header is 1024 bytes",
            ));
        }
        let mut r = Cursor::new(bytes);
        let mut num = [0i32; 3];
        r.read_i32_into::<LittleEndian>(&mut num)?;
        let pixel_type = r.read_i32::<LittleEndian>()?;
        r.set_position(40);
        let mut pixel_size = [0f32; 3];
        r.read_f32_into::<LittleEndian>(&mut pixel_size)?;
        r.set_position(76);
        let mut mmm1 = [0f32; 3];
        r.read_f32_into::<LittleEndian>(&mut mmm1)?;
        r.set_position(92);
        let next = r.read_i32::<LittleEndian>()?;
        r.set_position(128);
        let num_integers = r.read_i16::<LittleEndian>()?;
        let num_floats = r.read_i16::<LittleEndian>()?;
        r.set_position(136);
        let mut mm = [[0f32; 2]; 4];
        for pair in mm.iter_mut().take(3) {
            r.read_f32_into::<LittleEndian>(pair)?;
        }
        r.set_position(162);
        let lens_num = r.read_i16::<LittleEndian>()?;
        r.set_position(172);
        r.read_f32_into::<LittleEndian>(&mut mm[3])?;
        let num_times = r.read_i16::<LittleEndian>()?;
        let img_sequence = r.read_i16::<LittleEndian>()?;
        r.set_position(196);
        let num_waves = r.read_i16::<LittleEndian>()?;
        let mut wave = [0i16; 5];
        r.read_i16_into::<LittleEndian>(&mut wave)?;
        r.set_position(220);
        let num_titles = r.read_i32::<LittleEndian>()?.clamp(0, MAX_TITLES as i32) as usize;
        let mut titles = Vec::with_capacity(num_titles);
        for _ in 0..num_titles {
            let mut field = [0u8; TITLE_LEN];
            r.read_exact(&mut field)?;
            let end = field.iter().position(|&b| b == 0).unwrap_or(TITLE_LEN);
            titles.push(String::from_utf8_lossy(&field[..end]).into_owned());
        }
        Ok(Self {
            num,
            pixel_type,
            pixel_size,
            mmm1,
            next,
            num_integers,
            num_floats,
            mm,
            lens_num,
            num_times,
            img_sequence,
            num_waves,
            wave,
            titles,
        })
    }
}

/// Per-plane metadata in the extended header.
///
/// Of the 32 floats only elapsed time (1), min (5), max (6), excitation (10),
/// emission (11) and intensity scaling (12) are filled in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneMetadata {
    /// Seconds since the first image of the experiment.
    pub elapsed: f32,
    pub min: f32,
    pub max: f32,
    pub excitation: f32,
    pub emission: f32,
}

impl PlaneMetadata {
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut floats = [0f32; EXT_FLOATS];
        floats[1] = self.elapsed;
        floats[5] = self.min;
        floats[6] = self.max;
        floats[10] = self.excitation;
        floats[11] = self.emission;
        floats[12] = 1.0;

        let mut out = Vec::with_capacity(EXT_BYTES_PER_PLANE as usize);
        for _ in 0..EXT_INTS {
            out.write_i32::<LittleEndian>(0)?;
        }
        for v in floats {
            out.write_f32::<LittleEndian>(v)?;
        }
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> io::Result<Self> {
        let mut r = Cursor::new(bytes);
        r.set_position((EXT_INTS * 4) as u64);
        let mut floats = [0f32; EXT_FLOATS];
        r.read_f32_into::<LittleEndian>(&mut floats)?;
        Ok(Self {
            elapsed: floats[1],
            min: floats[5],
            max: floats[6],
            excitation: floats[10],
            emission: floats[11],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> DvHeader {
        DvHeader::for_shape(2, 3, 4, 16, 32, 0.1, 0.5, &[Some(525.0), None])
    }

    #[test]
    fn base_header_is_1024_bytes_with_fixed_offsets() {
        let mut h = header();
        h.next = 160 * 24;
        h.set_titles(&["first".to_string(), "second".to_string()]).unwrap();
        let bytes = h.to_bytes().unwrap();
        assert_eq!(bytes.len(), 1024);
        assert_eq!(&bytes[0..4], &32i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &24i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &PIXEL_TYPE_U16.to_le_bytes());
        assert_eq!(&bytes[92..96], &(160i32 * 24).to_le_bytes());
        assert_eq!(&bytes[96..98], &DVID.to_le_bytes());
        assert_eq!(&bytes[182..184], &IMG_SEQUENCE_WZT.to_le_bytes());
        assert_eq!(&bytes[198..200], &525i16.to_le_bytes());
        assert_eq!(&bytes[220..224], &2i32.to_le_bytes());
        assert_eq!(&bytes[224..229], b"first");
        assert_eq!(&bytes[304..310], b"second");
    }

    #[test]
    fn header_reads_back() {
        let mut h = header();
        h.set_min_max(0, 3.0, 900.0);
        h.set_min_max(1, 4.0, 800.0);
        h.set_min_max(4, 5.0, 700.0);
        let parsed = DvHeader::from_bytes(&h.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(parsed.mmm1, [3.0, 900.0, 0.0]);
        assert_eq!(parsed.mm[3], [5.0, 700.0]);
    }

    #[test]
    fn titles_are_limited() {
        let mut h = header();
        let eleven: Vec<String> = (0..11).map(|i| i.to_string()).collect();
        assert!(matches!(
            h.set_titles(&eleven),
            Err(CockpitError::TitlesOverflow { count: 11, .. })
        ));
        assert!(h.set_titles(&["x".repeat(81)]).is_err());
        assert!(h.set_titles(&["x".repeat(80)]).is_ok());
    }

    #[test]
    fn plane_metadata_layout() {
        let meta = PlaneMetadata {
            elapsed: 1.5,
            min: 2.0,
            max: 3.0,
            excitation: 488.0,
            emission: 525.0,
        };
        let bytes = meta.to_bytes().unwrap();
        assert_eq!(bytes.len() as u64, EXT_BYTES_PER_PLANE);
        assert!(bytes[..32].iter().all(|&b| b == 0));
        assert_eq!(&bytes[32 + 4..32 + 8], &1.5f32.to_le_bytes());
        assert_eq!(&bytes[32 + 48..32 + 52], &1.0f32.to_le_bytes());
        assert_eq!(PlaneMetadata::from_bytes(&bytes).unwrap(), meta);
    }
}
