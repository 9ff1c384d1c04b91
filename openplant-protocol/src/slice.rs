//! Homogeneous arrays (`VarType::Slice`).
//!
//! ```text
//! slice := <bin-header> <elemType:1> <element>*
//! element := fixed value (BE, natural width) | <bin-header><body>
//! ```

use crate::error::ProtocolError;
use crate::msgpack::{self, Reader};
use crate::types::VarType;
use crate::value::Value;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// A decoded slice. Elements are read lazily from the retained body.
#[derive(Clone)]
pub struct OpSlice {
    body: Bytes,
    elem: VarType,
    len: usize,
    /// Body spans of variable elements; empty for fixed element types.
    steps: Vec<(u32, u32)>,
}

impl OpSlice {
    /// Builds a slice of `elem` typed values, coercing each element.
    pub fn from_values(elem: VarType, values: &[Value]) -> Result<Self, ProtocolError> {
        if elem == VarType::Null {
            return Err(ProtocolError::malformed("slice", "null element type"));
        }
        let mut body = BytesMut::new();
        body.put_u8(elem.code());
        for value in values {
            let value = value.coerce(elem)?;
            match elem.fixed_width() {
                Some(width) => value.encode_fixed(width, &mut body),
                None => value.encode_variable(elem, &mut body),
            }
        }
        Self::from_body(body.freeze())
    }

    /// Parses a body (`<elemType><element>*`), taking ownership of it.
    pub fn from_body(body: Bytes) -> Result<Self, ProtocolError> {
        let (&code, data) = body
            .split_first()
            .ok_or_else(|| ProtocolError::malformed("slice", "missing element type"))?;
        let elem = VarType::try_from(code)?;
        if let Some(width) = elem.fixed_width() {
            if data.len() % width != 0 {
                return Err(ProtocolError::malformed(
                    "slice",
                    format!("{} bytes is not a multiple of {width}", data.len()),
                ));
            }
            return Ok(Self {
                len: data.len() / width,
                body,
                elem,
                steps: Vec::new(),
            });
        }

        let mut steps = Vec::new();
        let mut r = Reader::new(data);
        while !r.is_empty() {
            let n = r.read_bin_len()?;
            let start = 1 + r.position();
            r.skip(n)?;
            steps.push((start as u32, n as u32));
        }
        Ok(Self {
            len: steps.len(),
            body,
            elem,
            steps,
        })
    }

    /// Decodes `<bin-header><body>`; the empty sentinel yields `None`.
    ///
    /// The body is copied once so the result does not borrow `data`.
    pub fn decode(data: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let body = Reader::new(data).read_bin()?;
        if body.is_empty() {
            return Ok(None);
        }
        Self::from_body(Bytes::copy_from_slice(body)).map(Some)
    }

    /// Writes `<bin-header><body>`.
    pub fn encode(&self, out: &mut impl BufMut) {
        msgpack::write_bin(out, &self.body);
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn elem_type(&self) -> VarType {
        self.elem
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns element `index`.
    pub fn get(&self, index: usize) -> Result<Value, ProtocolError> {
        if index >= self.len {
            return Err(ProtocolError::ColumnOutOfRange {
                index,
                count: self.len,
            });
        }
        match self.elem.fixed_width() {
            Some(width) => {
                let start = 1 + index * width;
                Value::decode_fixed(self.elem, &self.body[start..start + width])
            }
            None => {
                let (pos, len) = self.steps[index];
                let (pos, len) = (pos as usize, len as usize);
                Value::decode_body(self.elem, self.body.slice(pos..pos + len))
            }
        }
    }

    pub fn iter(&self) -> SliceIter<'_> {
        SliceIter {
            slice: self,
            next: 0,
        }
    }

    /// Decodes every element.
    pub fn to_vec(&self) -> Result<Vec<Value>, ProtocolError> {
        self.iter().collect()
    }
}

impl PartialEq for OpSlice {
    fn eq(&self, other: &Self) -> bool {
        self.body == other.body
    }
}

impl fmt::Debug for OpSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpSlice")
            .field("elem", &self.elem)
            .field("len", &self.len)
            .finish()
    }
}

impl fmt::Display for OpSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Value::Slice(self.clone()), f)
    }
}

/// Cursor over the elements of an [`OpSlice`].
pub struct SliceIter<'a> {
    slice: &'a OpSlice,
    next: usize,
}

impl SliceIter<'_> {
    /// Index of the element the next call to `next()` returns.
    pub fn position(&self) -> usize {
        self.next
    }
}

impl Iterator for SliceIter<'_> {
    type Item = Result<Value, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.slice.len {
            return None;
        }
        let item = self.slice.get(self.next);
        self.next += 1;
        Some(item)
    }

    fn nth(&mut self, n: usize) -> Option<Self::Item> {
        self.next = self.next.saturating_add(n);
        self.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.slice.len.saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for SliceIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encoded(slice: &OpSlice) -> Vec<u8> {
        let mut out = Vec::new();
        slice.encode(&mut out);
        out
    }

    #[test]
    fn test_fixed_layout() {
        let s = OpSlice::from_values(VarType::Int16, &[Value::Int16(1), Value::Int16(-2)]).unwrap();
        assert_eq!(encoded(&s), vec![0xc4, 5, 3, 0x00, 0x01, 0xff, 0xfe]);
        assert_eq!(s.len(), 2);
        assert_eq!(s.get(1).unwrap(), Value::Int16(-2));
    }

    #[test]
    fn test_variable_layout() {
        let s = OpSlice::from_values(VarType::String, &[Value::from("ab"), Value::from("")]).unwrap();
        assert_eq!(encoded(&s), vec![0xc4, 7, 9, 0xc4, 2, b'a', b'b', 0xc4, 0]);
        assert_eq!(s.get(0).unwrap(), Value::from("ab"));
        assert_eq!(s.get(1).unwrap(), Value::from(""));
    }

    #[test]
    fn test_coerces_elements() {
        let s = OpSlice::from_values(VarType::Double, &[Value::Int32(3), Value::Float(0.5)]).unwrap();
        assert_eq!(s.to_vec().unwrap(), vec![Value::Double(3.0), Value::Double(0.5)]);
        assert!(OpSlice::from_values(VarType::Int32, &[Value::from("x")]).is_err());
    }

    #[test]
    fn test_decode_empty_sentinel() {
        assert!(OpSlice::decode(&msgpack::EMPTY_BIN).unwrap().is_none());
    }

    #[test]
    fn test_decode_copies_input() {
        let s = OpSlice::from_values(VarType::Int32, &[Value::Int32(7)]).unwrap();
        let mut wire = encoded(&s);
        let back = OpSlice::decode(&wire).unwrap().unwrap();
        wire.iter_mut().for_each(|b| *b = 0);
        assert_eq!(back.get(0).unwrap(), Value::Int32(7));
    }

    #[test]
    fn test_nested_slices() {
        let inner_a = OpSlice::from_values(VarType::Int8, &[Value::Int8(1), Value::Int8(2)]).unwrap();
        let inner_b = OpSlice::from_values(VarType::Int8, &[Value::Int8(3)]).unwrap();
        let outer = OpSlice::from_values(
            VarType::Slice,
            &[Value::Slice(inner_a.clone()), Value::Null, Value::Slice(inner_b.clone())],
        )
        .unwrap();
        assert_eq!(outer.len(), 3);
        assert_eq!(outer.get(0).unwrap(), Value::Slice(inner_a));
        assert_eq!(outer.get(1).unwrap(), Value::Null);
        assert_eq!(outer.get(2).unwrap(), Value::Slice(inner_b));
    }

    #[test]
    fn test_object_elements() {
        let s = OpSlice::from_values(
            VarType::Object,
            &[Value::Int32(1), Value::from("two"), Value::Double(3.0)],
        )
        .unwrap();
        assert_eq!(
            s.to_vec().unwrap(),
            vec![Value::Int32(1), Value::from("two"), Value::Double(3.0)]
        );
    }

    #[test]
    fn test_truncated_body() {
        let body = Bytes::from_static(&[4, 0, 0, 0]);
        assert!(OpSlice::from_body(body).is_err());
        let body = Bytes::from_static(&[9, 0xc4, 5, b'a']);
        assert!(matches!(
            OpSlice::from_body(body),
            Err(ProtocolError::Incomplete { .. })
        ));
    }

    #[test]
    fn test_out_of_range() {
        let s = OpSlice::from_values(VarType::Int32, &[]).unwrap();
        assert!(s.is_empty());
        assert!(matches!(s.get(0), Err(ProtocolError::ColumnOutOfRange { .. })));
    }

    #[test]
    fn test_iterator_position() {
        let s = OpSlice::from_values(VarType::Int64, &[Value::Int64(1), Value::Int64(2)]).unwrap();
        let mut it = s.iter();
        assert_eq!(it.position(), 0);
        it.next();
        assert_eq!(it.position(), 1);
        assert_eq!(it.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_random_access_matches_iteration(values in proptest::collection::vec(".{0,20}", 0..50)) {
            let values: Vec<Value> = values.into_iter().map(Value::String).collect();
            let s = OpSlice::from_values(VarType::String, &values).unwrap();
            let decoded = OpSlice::decode(&encoded(&s)).unwrap();
            let len = decoded.as_ref().map_or(0, |d| d.len());
            prop_assert_eq!(len, values.len());
            if let Some(d) = decoded {
                for (i, expected) in values.iter().enumerate() {
                    prop_assert_eq!(&d.iter().nth(i).unwrap().unwrap(), expected);
                    prop_assert_eq!(&d.get(i).unwrap(), expected);
                }
            }
        }

        #[test]
        fn prop_fixed_random_access(values in proptest::collection::vec(any::<i32>(), 0..100)) {
            let values: Vec<Value> = values.into_iter().map(Value::Int32).collect();
            let s = OpSlice::from_values(VarType::Int32, &values).unwrap();
            for i in 0..values.len() {
                prop_assert_eq!(s.iter().nth(i).unwrap().unwrap(), values[i].clone());
            }
        }
    }
}
