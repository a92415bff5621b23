//! Binary files of stores written by I/O tasks.
//!
//! A tile file holds the `i64` extents of one tile followed by its elements in C order.
//! A tiled directory holds one tile file per color, named `<c0>.<c1>...`, and a
//! [`HEADER_FILE_NAME`] file that describes the whole array. A flat file holds a 1-D array
//! preceded by its `i64` type code and `u64` element count. Every value is host-native.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::Path;

use log::debug;

use crate::domain::{Domain, Point};
use crate::error::{CoreError, CoreResult};
use crate::types::{double_dispatch, NativeType, TypeCode, TypeDimVisitor, MAX_DIM};

pub const HEADER_FILE_NAME: &str = ".header";

struct ElementSize;

impl TypeDimVisitor for ElementSize {
    type Output = usize;

    fn visit<T: NativeType, const DIM: usize>(self) -> usize {
        T::size()
    }
}

fn element_size(type_code: TypeCode, ndim: usize) -> CoreResult<usize> {
    double_dispatch(type_code, ndim, ElementSize)
}

fn read_array<const N: usize>(reader: &mut impl Read) -> CoreResult<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_i32(reader: &mut impl Read) -> CoreResult<i32> {
    Ok(i32::from_ne_bytes(read_array(reader)?))
}

fn read_i64(reader: &mut impl Read) -> CoreResult<i64> {
    Ok(i64::from_ne_bytes(read_array(reader)?))
}

fn read_u64(reader: &mut impl Read) -> CoreResult<u64> {
    Ok(u64::from_ne_bytes(read_array(reader)?))
}

fn non_negative<T>(value: T, what: &str) -> CoreResult<u64>
where
    T: TryInto<u64> + Copy + std::fmt::Display,
{
    value
        .try_into()
        .map_err(|_| CoreError::invalid(format!("negative {what} in file: {value}")))
}

fn to_i32(value: u64, what: &str) -> CoreResult<i32> {
    i32::try_from(value).map_err(|_| CoreError::invalid(format!("{what} {value} overflows i32")))
}

fn to_usize(value: u64) -> CoreResult<usize> {
    usize::try_from(value).map_err(|_| CoreError::invalid(format!("size {value} overflows usize")))
}

/// The number of bytes held by an array of `extents` with elements of `element_size` bytes.
fn byte_len(extents: &[u64], element_size: usize) -> CoreResult<usize> {
    extents
        .iter()
        .try_fold(element_size, |acc, e| acc.checked_mul(usize::try_from(*e).ok()?))
        .ok_or_else(|| {
            CoreError::invalid(format!(
                "an array of extents {extents:?} with {element_size}-byte elements is too large"
            ))
        })
}

/// Reads exactly `len` bytes without allocating more than the reader provides.
fn read_bytes(reader: &mut impl Read, len: usize) -> CoreResult<Vec<u8>> {
    let mut data = Vec::new();
    reader.take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(CoreError::IoError(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes but found {}", data.len()),
        )));
    }
    Ok(data)
}

/// The description of a tiled array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileHeader {
    pub type_code: TypeCode,
    pub shape: Vec<u64>,
    pub tile_shape: Vec<u64>,
}

impl TileHeader {
    pub fn try_new(type_code: TypeCode, shape: Vec<u64>, tile_shape: Vec<u64>) -> CoreResult<Self> {
        if shape.len() != tile_shape.len() {
            return Err(CoreError::invalid(format!(
                "tile shape {tile_shape:?} does not match array shape {shape:?}"
            )));
        }
        if tile_shape.iter().any(|x| *x == 0) {
            return Err(CoreError::invalid(format!(
                "tile shape {tile_shape:?} has an empty axis"
            )));
        }
        element_size(type_code, shape.len())?;
        Ok(Self {
            type_code,
            shape,
            tile_shape,
        })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn element_size(&self) -> CoreResult<usize> {
        element_size(self.type_code, self.ndim())
    }

    pub fn color_shape(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(&self.tile_shape)
            .map(|(s, t)| s.div_ceil(*t))
            .collect()
    }

    /// The rectangle of the array covered by the tile of `color`.
    pub fn tile_domain(&self, color: &Point) -> CoreResult<Domain> {
        let colors = Domain::from_extents(&self.color_shape());
        if !colors.contains(color) {
            return Err(CoreError::invalid(format!(
                "color {color} is outside of color space {colors}"
            )));
        }
        let origin = color
            .coords()
            .iter()
            .zip(&self.tile_shape)
            .map(|(c, t)| *c * *t as i64)
            .collect::<Vec<_>>();
        let extents = origin
            .iter()
            .zip(self.tile_shape.iter().zip(&self.shape))
            .map(|(o, (t, s))| (*t).min(s - *o as u64))
            .collect::<Vec<_>>();
        Ok(Domain::from_origin(&origin, &extents))
    }
}

pub fn write_header(writer: &mut impl Write, header: &TileHeader) -> CoreResult<()> {
    writer.write_all(&(header.type_code as i32).to_ne_bytes())?;
    writer.write_all(&to_i32(header.ndim() as u64, "dimension")?.to_ne_bytes())?;
    for extent in header.shape.iter().chain(&header.tile_shape) {
        writer.write_all(&to_i32(*extent, "extent")?.to_ne_bytes())?;
    }
    Ok(())
}

pub fn read_header(reader: &mut impl Read) -> CoreResult<TileHeader> {
    let type_code = TypeCode::try_from(read_i32(reader)?)?;
    let ndim = to_usize(non_negative(read_i32(reader)?, "dimension")?)?;
    if ndim == 0 || ndim > MAX_DIM {
        return Err(CoreError::invalid(format!(
            "dimension {ndim} in file (supported dimensions are 1 to {MAX_DIM})"
        )));
    }
    let mut extents = Vec::with_capacity(2 * ndim);
    for _ in 0..2 * ndim {
        extents.push(non_negative(read_i32(reader)?, "extent")?);
    }
    let tile_shape = extents.split_off(ndim);
    TileHeader::try_new(type_code, extents, tile_shape)
}

/// The extents and elements of one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub extents: Vec<u64>,
    pub data: Vec<u8>,
}

pub fn write_tile(writer: &mut impl Write, extents: &[u64], data: &[u8]) -> CoreResult<()> {
    for extent in extents {
        let extent = i64::try_from(*extent)
            .map_err(|_| CoreError::invalid(format!("extent {extent} overflows i64")))?;
        writer.write_all(&extent.to_ne_bytes())?;
    }
    writer.write_all(data)?;
    Ok(())
}

pub fn read_tile(reader: &mut impl Read, ndim: usize, element_size: usize) -> CoreResult<Tile> {
    if ndim > MAX_DIM {
        return Err(CoreError::invalid(format!("a tile cannot have {ndim} dimensions")));
    }
    let mut extents = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        extents.push(non_negative(read_i64(reader)?, "extent")?);
    }
    let data = read_bytes(reader, byte_len(&extents, element_size)?)?;
    Ok(Tile { extents, data })
}

/// The name of the file that holds the tile of `color`.
pub fn tile_file_name(color: &Point) -> String {
    color
        .coords()
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// A whole array split into the tiles of a [`TileHeader`], in C order of the colors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiledArray {
    pub header: TileHeader,
    pub tiles: Vec<(Point, Tile)>,
}

impl TiledArray {
    /// Splits `data`, the elements of the whole array in C order, into tiles.
    pub fn split(header: TileHeader, data: &[u8]) -> CoreResult<Self> {
        let size = header.element_size()?;
        let bounds = Domain::from_extents(&header.shape);
        if data.len() != byte_len(&header.shape, size)? {
            return Err(CoreError::invalid(format!(
                "{} bytes do not hold an array of shape {:?}",
                data.len(),
                header.shape
            )));
        }
        let mut tiles = vec![];
        for color in Domain::from_extents(&header.color_shape()).points() {
            let domain = header.tile_domain(&color)?;
            let mut tile = Vec::with_capacity(to_usize(domain.volume())? * size);
            for point in domain.points() {
                let offset = to_usize(bounds.linearize(&point)?)? * size;
                tile.extend_from_slice(&data[offset..offset + size]);
            }
            tiles.push((
                color,
                Tile {
                    extents: domain.extents(),
                    data: tile,
                },
            ));
        }
        Ok(Self { header, tiles })
    }

    /// Reassembles the elements of the whole array in C order.
    pub fn assemble(&self) -> CoreResult<Vec<u8>> {
        let size = self.header.element_size()?;
        let bounds = Domain::from_extents(&self.header.shape);
        let mut data = vec![0u8; byte_len(&self.header.shape, size)?];
        for (color, tile) in &self.tiles {
            let domain = self.header.tile_domain(color)?;
            if tile.extents != domain.extents() {
                return Err(CoreError::invalid(format!(
                    "tile {color} has extents {:?} but covers {domain}",
                    tile.extents
                )));
            }
            if tile.data.len() != byte_len(&tile.extents, size)? {
                return Err(CoreError::invalid(format!(
                    "tile {color} holds {} bytes for extents {:?}",
                    tile.data.len(),
                    tile.extents
                )));
            }
            for (i, point) in domain.points().enumerate() {
                let offset = to_usize(bounds.linearize(&point)?)? * size;
                data[offset..offset + size].copy_from_slice(&tile.data[i * size..(i + 1) * size]);
            }
        }
        Ok(data)
    }

    pub fn values<T: NativeType>(&self) -> CoreResult<Vec<T>> {
        if T::ty().code() != self.header.type_code {
            return Err(CoreError::invalid(format!(
                "cannot read {} elements as {}",
                self.header.type_code,
                T::ty()
            )));
        }
        let size = T::size();
        Ok(self
            .assemble()?
            .chunks_exact(size)
            .map(T::read_bytes)
            .collect())
    }
}

/// Writes the header and every tile of `array` into `dir`, creating it if needed.
pub fn write_tiled_dir(dir: &Path, array: &TiledArray) -> CoreResult<()> {
    fs::create_dir_all(dir)?;
    let size = array.header.element_size()?;
    for (color, tile) in &array.tiles {
        if tile.data.len() != byte_len(&tile.extents, size)? {
            return Err(CoreError::invalid(format!(
                "tile {color} holds {} bytes for extents {:?}",
                tile.data.len(),
                tile.extents
            )));
        }
        let path = dir.join(tile_file_name(color));
        debug!("write to {}", path.display());
        let mut writer = BufWriter::new(File::create(path)?);
        write_tile(&mut writer, &tile.extents, &tile.data)?;
        writer.flush()?;
    }
    let path = dir.join(HEADER_FILE_NAME);
    debug!("write to {}", path.display());
    let mut writer = BufWriter::new(File::create(path)?);
    write_header(&mut writer, &array.header)?;
    writer.flush()?;
    Ok(())
}

/// Reads the header of `dir` and the tile of every color it describes.
pub fn read_tiled_dir(dir: &Path) -> CoreResult<TiledArray> {
    let header = read_header(&mut BufReader::new(File::open(dir.join(HEADER_FILE_NAME))?))?;
    let size = header.element_size()?;
    let mut tiles = vec![];
    for color in Domain::from_extents(&header.color_shape()).points() {
        let path = dir.join(tile_file_name(&color));
        debug!("read {}", path.display());
        let tile = read_tile(&mut BufReader::new(File::open(path)?), header.ndim(), size)?;
        tiles.push((color, tile));
    }
    Ok(TiledArray { header, tiles })
}

/// A 1-D array with its type code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatFile {
    pub type_code: TypeCode,
    pub count: u64,
    pub data: Vec<u8>,
}

impl FlatFile {
    pub fn try_new(type_code: TypeCode, data: Vec<u8>) -> CoreResult<Self> {
        let size = element_size(type_code, 1)?;
        if data.len() % size != 0 {
            return Err(CoreError::invalid(format!(
                "{} bytes do not hold whole {type_code} elements",
                data.len()
            )));
        }
        Ok(Self {
            type_code,
            count: (data.len() / size) as u64,
            data,
        })
    }

    /// The bytes that reader `reader_id` of `num_readers` loads.
    pub fn section(&self, reader_id: u64, num_readers: u64) -> CoreResult<&[u8]> {
        let size = element_size(self.type_code, 1)?;
        let range = flat_reader_range(self.count, reader_id, num_readers)?;
        Ok(&self.data[to_usize(range.start)? * size..to_usize(range.end)? * size])
    }
}

/// The elements of a flat file of `count` elements that reader `reader_id` of
/// `num_readers` loads. Readers get contiguous sections of nearly equal size.
pub fn flat_reader_range(count: u64, reader_id: u64, num_readers: u64) -> CoreResult<Range<u64>> {
    if reader_id >= num_readers {
        return Err(CoreError::out_of_range(format!(
            "reader {reader_id} of {num_readers}"
        )));
    }
    let bound = |id: u64| (u128::from(id) * u128::from(count) / u128::from(num_readers)) as u64;
    Ok(bound(reader_id)..bound(reader_id + 1).min(count))
}

pub fn write_flat_file(writer: &mut impl Write, file: &FlatFile) -> CoreResult<()> {
    writer.write_all(&(file.type_code as i64).to_ne_bytes())?;
    writer.write_all(&file.count.to_ne_bytes())?;
    writer.write_all(&file.data)?;
    Ok(())
}

pub fn read_flat_file(reader: &mut impl Read) -> CoreResult<FlatFile> {
    let code = read_i64(reader)?;
    let code = i32::try_from(code)
        .map_err(|_| CoreError::invalid(format!("type code: {code}")))?;
    let type_code = TypeCode::try_from(code)?;
    let count = read_u64(reader)?;
    let size = element_size(type_code, 1)?;
    let data = read_bytes(reader, byte_len(&[count], size)?)?;
    Ok(FlatFile {
        type_code,
        count,
        data,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn int32_bytes(values: impl IntoIterator<Item = i32>) -> Vec<u8> {
        values.into_iter().flat_map(|x| x.to_ne_bytes()).collect()
    }

    #[test]
    fn test_header_layout() -> CoreResult<()> {
        let header = TileHeader::try_new(TypeCode::Float64, vec![10, 7], vec![4, 4])?;
        let mut buf = vec![];
        write_header(&mut buf, &header)?;
        assert_eq!(buf, int32_bytes([11, 2, 10, 7, 4, 4]));
        assert_eq!(read_header(&mut Cursor::new(buf))?, header);
        assert_eq!(header.color_shape(), vec![3, 2]);
        Ok(())
    }

    #[test]
    fn test_header_rejects_bad_input() {
        assert!(TileHeader::try_new(TypeCode::Int32, vec![4], vec![2, 2]).is_err());
        assert!(TileHeader::try_new(TypeCode::Int32, vec![4], vec![0]).is_err());
        assert!(TileHeader::try_new(TypeCode::String, vec![4], vec![2]).is_err());
        assert!(read_header(&mut Cursor::new(int32_bytes([3, 1, -4, 2]))).is_err());
        assert!(read_header(&mut Cursor::new(int32_bytes([99, 1, 4, 2]))).is_err());
    }

    #[test]
    fn test_tile_layout() -> CoreResult<()> {
        let mut buf = vec![];
        write_tile(&mut buf, &[2, 1], &int32_bytes([5, 6]))?;
        assert_eq!(buf.len(), 2 * 8 + 2 * 4);
        assert_eq!(&buf[..8], &2i64.to_ne_bytes());
        let tile = read_tile(&mut Cursor::new(buf), 2, 4)?;
        assert_eq!(tile.extents, vec![2, 1]);
        assert_eq!(tile.data, int32_bytes([5, 6]));
        Ok(())
    }

    #[test]
    fn test_truncated_tile() {
        let mut buf = vec![];
        assert!(write_tile(&mut buf, &[3], &int32_bytes([1, 2, 3])).is_ok());
        buf.truncate(buf.len() - 1);
        assert!(matches!(
            read_tile(&mut Cursor::new(buf), 1, 4),
            Err(CoreError::IoError(_))
        ));
    }

    #[test]
    fn test_corrupt_sizes_are_rejected() {
        let mut buf = vec![];
        assert!(write_tile(&mut buf, &[u64::MAX / 2 / 8, 4], &[]).is_ok());
        assert!(matches!(
            read_tile(&mut Cursor::new(buf), 2, 8),
            Err(CoreError::InvalidArgument(_))
        ));

        let mut buf = vec![];
        assert!(write_tile(&mut buf, &[1 << 40], &[]).is_ok());
        assert!(matches!(
            read_tile(&mut Cursor::new(buf), 1, 4),
            Err(CoreError::IoError(_))
        ));

        let header = int32_bytes([3, i32::MAX]);
        assert!(matches!(
            read_header(&mut Cursor::new(header)),
            Err(CoreError::InvalidArgument(_))
        ));

        let mut flat = 3i64.to_ne_bytes().to_vec();
        flat.extend_from_slice(&u64::MAX.to_ne_bytes());
        assert!(read_flat_file(&mut Cursor::new(flat)).is_err());
    }

    #[test]
    fn test_tile_file_name() {
        assert_eq!(tile_file_name(&Point::new([0])), "0");
        assert_eq!(tile_file_name(&Point::new([1, 0, 2])), "1.0.2");
    }

    #[test]
    fn test_split_uneven_tiles() -> CoreResult<()> {
        let header = TileHeader::try_new(TypeCode::Int32, vec![3, 3], vec![2, 2])?;
        let array = TiledArray::split(header, &int32_bytes(0..9))?;
        let tiles = array
            .tiles
            .iter()
            .map(|(c, t)| (tile_file_name(c), t.extents.clone(), t.data.clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            tiles,
            vec![
                ("0.0".to_string(), vec![2, 2], int32_bytes([0, 1, 3, 4])),
                ("0.1".to_string(), vec![2, 1], int32_bytes([2, 5])),
                ("1.0".to_string(), vec![1, 2], int32_bytes([6, 7])),
                ("1.1".to_string(), vec![1, 1], int32_bytes([8])),
            ]
        );
        assert_eq!(array.values::<i32>()?, (0..9).collect::<Vec<_>>());
        assert!(array.values::<i64>().is_err());
        Ok(())
    }

    #[test]
    fn test_tiled_dir() -> CoreResult<()> {
        let dir = std::env::temp_dir().join(format!("tessera-tiles-{}", std::process::id()));
        let header = TileHeader::try_new(TypeCode::Int32, vec![5], vec![2])?;
        let array = TiledArray::split(header, &int32_bytes([1, 2, 3, 4, 5]))?;
        write_tiled_dir(&dir, &array)?;
        for name in [HEADER_FILE_NAME, "0", "1", "2"] {
            assert!(dir.join(name).is_file(), "missing {name}");
        }
        let loaded = read_tiled_dir(&dir)?;
        fs::remove_dir_all(&dir)?;
        assert_eq!(loaded, array);
        assert_eq!(loaded.values::<i32>()?, vec![1, 2, 3, 4, 5]);
        Ok(())
    }

    #[test]
    fn test_flat_file() -> CoreResult<()> {
        let file = FlatFile::try_new(TypeCode::Int32, int32_bytes(0..10))?;
        let mut buf = vec![];
        write_flat_file(&mut buf, &file)?;
        assert_eq!(&buf[..8], &3i64.to_ne_bytes());
        assert_eq!(&buf[8..16], &10u64.to_ne_bytes());
        let loaded = read_flat_file(&mut Cursor::new(buf))?;
        assert_eq!(loaded, file);
        assert_eq!(loaded.section(2, 3)?, int32_bytes(6..10).as_slice());
        assert!(FlatFile::try_new(TypeCode::Int32, vec![0; 6]).is_err());
        Ok(())
    }

    #[test]
    fn test_flat_reader_range() -> CoreResult<()> {
        let ranges = (0..3)
            .map(|i| flat_reader_range(10, i, 3))
            .collect::<CoreResult<Vec<_>>>()?;
        assert_eq!(ranges, vec![0..3, 3..6, 6..10]);
        assert_eq!(flat_reader_range(2, 3, 4)?, 1..2);
        assert!(flat_reader_range(10, 3, 3).is_err());
        Ok(())
    }
}
