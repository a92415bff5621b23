use crate::domain::Domain;
use crate::error::{CoreError, CoreResult};

fn check_rect(domain: &Domain, rect: &Domain) -> CoreResult<()> {
    if !domain.contains_domain(rect) {
        return Err(CoreError::internal(format!(
            "rectangle {rect} is outside of buffer domain {domain}"
        )));
    }
    Ok(())
}

/// Copies the elements of `rect` out of a C-order buffer laid out over `domain`.
pub(crate) fn read_rect(
    buffer: &[u8],
    domain: &Domain,
    rect: &Domain,
    elem_size: usize,
) -> CoreResult<Vec<u8>> {
    check_rect(domain, rect)?;
    let mut output = Vec::with_capacity(rect.volume() as usize * elem_size);
    for point in rect.points() {
        let offset = domain.linearize(&point)? as usize * elem_size;
        output.extend_from_slice(&buffer[offset..offset + elem_size]);
    }
    Ok(output)
}

/// Copies `data`, laid out in C order over `rect`, into a buffer laid out over `domain`.
pub(crate) fn write_rect(
    buffer: &mut [u8],
    domain: &Domain,
    rect: &Domain,
    data: &[u8],
    elem_size: usize,
) -> CoreResult<()> {
    check_rect(domain, rect)?;
    if data.len() != rect.volume() as usize * elem_size {
        return Err(CoreError::internal(format!(
            "{} bytes do not cover rectangle {rect} of {elem_size}-byte elements",
            data.len()
        )));
    }
    for (i, point) in rect.points().enumerate() {
        let offset = domain.linearize(&point)? as usize * elem_size;
        buffer[offset..offset + elem_size]
            .copy_from_slice(&data[i * elem_size..(i + 1) * elem_size]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Point;

    #[test]
    fn test_rect_copies() -> CoreResult<()> {
        let domain = Domain::from_extents(&[3, 4]);
        let mut buffer = (0u8..12).collect::<Vec<_>>();
        let rect = Domain::new(Point::from([1, 1]), Point::from([2, 2]))?;
        assert_eq!(read_rect(&buffer, &domain, &rect, 1)?, vec![5, 6, 9, 10]);
        write_rect(&mut buffer, &domain, &rect, &[0, 0, 0, 0], 1)?;
        assert_eq!(buffer[5..7], [0, 0]);
        assert_eq!(buffer[8..11], [8, 0, 0]);
        let outside = Domain::from_extents(&[4, 4]);
        assert!(read_rect(&buffer, &domain, &outside, 1).is_err());
        Ok(())
    }
}
