use anyhow::anyhow;
use bytes::{BufMut, Bytes};


macro_rules! read_try_impl {
    ($try_reader: ident, $ty:ty, $getter: ident) => {
        fn $try_reader(&mut self) -> anyhow::Result<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(anyhow!("buffer underflow"));
            }
            Ok(self.$getter())
        }
    }
}


/// Checked little-endian reads, returning an error instead of panicking when the buffer is
///  too short. Names are chosen so they don't clash with `Buf`'s own `try_get_*` methods.
pub trait BufExt: bytes::Buf {
    read_try_impl!(try_read_u8, u8, get_u8);
    read_try_impl!(try_read_i32_le, i32, get_i32_le);
    read_try_impl!(try_read_i64_le, i64, get_i64_le);
    read_try_impl!(try_read_u64_le, u64, get_u64_le);
    read_try_impl!(try_read_f64_le, f64, get_f64_le);

    fn try_read_bytes(&mut self, len: usize) -> anyhow::Result<Bytes> {
        if self.remaining() < len {
            return Err(anyhow!("buffer underflow: expected {} bytes, {} remaining", len, self.remaining()));
        }
        Ok(self.copy_to_bytes(len))
    }

    fn try_read_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            return Err(anyhow!("buffer underflow: expected {} bytes, {} remaining", N, self.remaining()));
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    /// a NUL terminated UTF-8 string
    fn try_read_cstring(&mut self) -> anyhow::Result<String> {
        let mut raw = Vec::new();
        loop {
            match self.try_read_u8()? {
                0 => break,
                b => raw.push(b),
            }
        }
        Ok(String::from_utf8(raw)?)
    }
}

pub trait BufMutExt: bytes::BufMut {
    /// NB: the caller is responsible for `s` not containing NUL bytes
    fn put_cstring(&mut self, s: &str) {
        self.put_slice(s.as_bytes());
        self.put_u8(0);
    }
}

impl <T: bytes::Buf> BufExt for T {
}

impl <T: BufMut> BufMutExt for T {
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_cstring() {
        let mut buf = BytesMut::new();
        buf.put_cstring("herp");
        buf.put_u8(7);

        let mut b = buf.freeze();
        assert_eq!(b.try_read_cstring().unwrap(), "herp");
        assert_eq!(b.try_read_u8().unwrap(), 7);
        assert!(b.try_read_u8().is_err());
    }

    #[test]
    fn test_cstring_without_terminator() {
        let mut b: &[u8] = b"derp";
        assert!(b.try_read_cstring().is_err());
    }

    #[test]
    fn test_underflow() {
        let mut b: &[u8] = &[1, 2, 3];
        assert!(b.try_read_i32_le().is_err());
        assert!(b.try_read_bytes(4).is_err());
        assert_eq!(b.try_read_bytes(3).unwrap().as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_array() {
        let mut b: &[u8] = &[1, 2, 3, 4, 5];
        assert_eq!(b.try_read_array::<4>().unwrap(), [1, 2, 3, 4]);
        assert!(b.try_read_array::<2>().is_err());
        assert_eq!(b.try_read_array::<1>().unwrap(), [5]);
    }
}
