use bytes::{Buf, BufMut, BytesMut};
use geo_types::{Coord, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};

use crate::error::CodecError;

/// Ext codes 100-107: the WKB geometry family, mirroring the shapely types
/// the original service exchanged over the wire. 108 is reserved
/// (GeometryCollection) and intentionally unimplemented — see DESIGN.md.
pub const EXT_POINT: i8 = 100;
pub const EXT_LINESTRING: i8 = 101;
pub const EXT_POLYGON: i8 = 102;
pub const EXT_MULTIPOINT: i8 = 103;
pub const EXT_MULTILINESTRING: i8 = 104;
pub const EXT_MULTIPOLYGON: i8 = 105;

const WKB_POINT: u32 = 1;
const WKB_LINESTRING: u32 = 2;
const WKB_POLYGON: u32 = 3;
const WKB_MULTIPOINT: u32 = 4;
const WKB_MULTILINESTRING: u32 = 5;
const WKB_MULTIPOLYGON: u32 = 6;

/// A 2D geometry value, encoded on the wire as standard OGC WKB
/// (little-endian, no SRID) under its own extension code.
#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Point<f64>),
    LineString(LineString<f64>),
    Polygon(Polygon<f64>),
    MultiPoint(MultiPoint<f64>),
    MultiLineString(MultiLineString<f64>),
    MultiPolygon(MultiPolygon<f64>),
}

impl Geometry {
    pub fn ext_code(&self) -> i8 {
        match self {
            Geometry::Point(_) => EXT_POINT,
            Geometry::LineString(_) => EXT_LINESTRING,
            Geometry::Polygon(_) => EXT_POLYGON,
            Geometry::MultiPoint(_) => EXT_MULTIPOINT,
            Geometry::MultiLineString(_) => EXT_MULTILINESTRING,
            Geometry::MultiPolygon(_) => EXT_MULTIPOLYGON,
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        match self {
            Geometry::Point(p) => {
                write_header(&mut out, WKB_POINT);
                write_coord(&mut out, p.0);
            }
            Geometry::LineString(ls) => {
                write_header(&mut out, WKB_LINESTRING);
                write_ring(&mut out, ls);
            }
            Geometry::Polygon(poly) => {
                write_header(&mut out, WKB_POLYGON);
                let nrings = 1 + poly.interiors().len();
                out.put_u32_le(nrings as u32);
                write_ring(&mut out, poly.exterior());
                for ring in poly.interiors() {
                    write_ring(&mut out, ring);
                }
            }
            Geometry::MultiPoint(mp) => {
                write_header(&mut out, WKB_MULTIPOINT);
                out.put_u32_le(mp.0.len() as u32);
                for p in &mp.0 {
                    write_header(&mut out, WKB_POINT);
                    write_coord(&mut out, p.0);
                }
            }
            Geometry::MultiLineString(mls) => {
                write_header(&mut out, WKB_MULTILINESTRING);
                out.put_u32_le(mls.0.len() as u32);
                for ls in &mls.0 {
                    write_header(&mut out, WKB_LINESTRING);
                    write_ring(&mut out, ls);
                }
            }
            Geometry::MultiPolygon(mpoly) => {
                write_header(&mut out, WKB_MULTIPOLYGON);
                out.put_u32_le(mpoly.0.len() as u32);
                for poly in &mpoly.0 {
                    write_header(&mut out, WKB_POLYGON);
                    let nrings = 1 + poly.interiors().len();
                    out.put_u32_le(nrings as u32);
                    write_ring(&mut out, poly.exterior());
                    for ring in poly.interiors() {
                        write_ring(&mut out, ring);
                    }
                }
            }
        }
        out.to_vec()
    }

    pub(crate) fn decode(ext_code: i8, bytes: &[u8]) -> Result<Self, CodecError> {
        let mut p = bytes;
        let wkb_type = read_header(&mut p)?;
        let geometry = match (ext_code, wkb_type) {
            (EXT_POINT, WKB_POINT) => Geometry::Point(Point(read_coord(&mut p)?)),
            (EXT_LINESTRING, WKB_LINESTRING) => Geometry::LineString(read_ring(&mut p)?),
            (EXT_POLYGON, WKB_POLYGON) => Geometry::Polygon(read_polygon(&mut p)?),
            (EXT_MULTIPOINT, WKB_MULTIPOINT) => {
                let n = read_u32(&mut p)?;
                let mut pts = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    read_header(&mut p)?;
                    pts.push(Point(read_coord(&mut p)?));
                }
                Geometry::MultiPoint(MultiPoint(pts))
            }
            (EXT_MULTILINESTRING, WKB_MULTILINESTRING) => {
                let n = read_u32(&mut p)?;
                let mut lines = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    read_header(&mut p)?;
                    lines.push(read_ring(&mut p)?);
                }
                Geometry::MultiLineString(MultiLineString(lines))
            }
            (EXT_MULTIPOLYGON, WKB_MULTIPOLYGON) => {
                let n = read_u32(&mut p)?;
                let mut polys = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    read_header(&mut p)?;
                    polys.push(read_polygon(&mut p)?);
                }
                Geometry::MultiPolygon(MultiPolygon(polys))
            }
            _ => {
                return Err(CodecError::Malformed(format!(
                    "geometry ext code {ext_code} does not match wkb type {wkb_type}"
                )))
            }
        };
        Ok(geometry)
    }
}

fn write_header(out: &mut BytesMut, wkb_type: u32) {
    out.put_u8(1); // little-endian byte order marker
    out.put_u32_le(wkb_type);
}

fn read_header(p: &mut &[u8]) -> Result<u32, CodecError> {
    if p.remaining() < 5 {
        return Err(CodecError::Malformed("wkb header truncated".into()));
    }
    let byte_order = p.get_u8();
    if byte_order != 1 {
        return Err(CodecError::Malformed("only little-endian wkb is supported".into()));
    }
    Ok(p.get_u32_le())
}

fn write_coord(out: &mut BytesMut, c: Coord<f64>) {
    out.put_f64_le(c.x);
    out.put_f64_le(c.y);
}

fn read_coord(p: &mut &[u8]) -> Result<Coord<f64>, CodecError> {
    if p.remaining() < 16 {
        return Err(CodecError::Malformed("wkb coordinate truncated".into()));
    }
    Ok(Coord {
        x: p.get_f64_le(),
        y: p.get_f64_le(),
    })
}

fn read_u32(p: &mut &[u8]) -> Result<u32, CodecError> {
    if p.remaining() < 4 {
        return Err(CodecError::Malformed("wkb count truncated".into()));
    }
    Ok(p.get_u32_le())
}

fn write_ring(out: &mut BytesMut, ls: &LineString<f64>) {
    out.put_u32_le(ls.0.len() as u32);
    for c in &ls.0 {
        write_coord(out, *c);
    }
}

fn read_ring(p: &mut &[u8]) -> Result<LineString<f64>, CodecError> {
    let n = read_u32(p)?;
    let mut coords = Vec::with_capacity(n as usize);
    for _ in 0..n {
        coords.push(read_coord(p)?);
    }
    Ok(LineString(coords))
}

fn read_polygon(p: &mut &[u8]) -> Result<Polygon<f64>, CodecError> {
    let nrings = read_u32(p)?;
    if nrings == 0 {
        return Err(CodecError::Malformed("polygon with no rings".into()));
    }
    let exterior = read_ring(p)?;
    let mut interiors = Vec::with_capacity(nrings as usize - 1);
    for _ in 1..nrings {
        interiors.push(read_ring(p)?);
    }
    Ok(Polygon::new(exterior, interiors))
}
