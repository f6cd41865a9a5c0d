//! Call and continuation-frame encoding.
//!
//! A job's continuation is the pair `(state, stack)`:
//! - `state` is the next invocation to run, a method name plus keyword
//!   arguments, encoded as a msgpack blob;
//! - `stack` is the list of frames waiting for a nested call to return.
//!
//! Keyword arguments live in a `BTreeMap` and `serde_json` objects are
//! key-sorted, so encoding the same call twice yields identical bytes.

use bytes::Bytes;
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{Error, Result};

/// Keyword arguments of a call.
pub type Kwargs = BTreeMap<String, Value>;

/// Caller-supplied job metadata.
pub type Extra = BTreeMap<String, Value>;

/// A method invocation: method name plus keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub method: String,
    #[serde(default)]
    pub kwargs: Kwargs,
}

impl Call {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            kwargs: Kwargs::new(),
        }
    }

    /// Add a keyword argument, serializing it to a JSON value.
    pub fn arg<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Result<Self> {
        let name = name.into();
        let encoded = ensure_finite(value).and_then(|()| serde_json::to_value(value).map_err(|e| e.to_string()));
        let value = encoded.map_err(|e| Error::encoding(format!("argument {} of {}: {}", name, self.method, e)))?;
        self.kwargs.insert(name, value);
        Ok(self)
    }

    /// Encode this call into a state blob.
    pub fn dump(&self) -> Result<State> {
        dump_call(&self.method, &self.kwargs)
    }
}

/// A frame waiting on a nested call.
///
/// When the nested call returns `value`, the engine continues with
/// `method(kwargs + {result_arg: value})`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub method: String,
    #[serde(default)]
    pub kwargs: Kwargs,
    pub result_arg: String,
}

impl Frame {
    pub fn new(call: Call, result_arg: impl Into<String>) -> Self {
        Self {
            method: call.method,
            kwargs: call.kwargs,
            result_arg: result_arg.into(),
        }
    }

    /// Turn this frame back into a call carrying the callee's return value.
    pub fn resume_with(self, value: Value) -> Call {
        let mut kwargs = self.kwargs;
        kwargs.insert(self.result_arg, value);
        Call {
            method: self.method,
            kwargs,
        }
    }
}

/// Opaque, storable encoding of a call.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct State(Bytes);

impl State {
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "State({} bytes)", self.0.len())
    }
}

/// JSON turns NaN and infinities into `null`; reject them instead.
fn ensure_finite<T: Serialize + ?Sized>(value: &T) -> std::result::Result<(), String> {
    let packed = rmp_serde::to_vec(value).map_err(|e| e.to_string())?;
    rmp_serde::from_slice::<FiniteCheck>(&packed)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Walks a decoded value and fails on the first non-finite float.
struct FiniteCheck;

impl<'de> Deserialize<'de> for FiniteCheck {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(FiniteVisitor)
    }
}

struct FiniteVisitor;

impl<'de> Visitor<'de> for FiniteVisitor {
    type Value = FiniteCheck;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a value representable as JSON")
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> std::result::Result<FiniteCheck, E> {
        Ok(FiniteCheck)
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> std::result::Result<FiniteCheck, E> {
        Ok(FiniteCheck)
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> std::result::Result<FiniteCheck, E> {
        Ok(FiniteCheck)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<FiniteCheck, E> {
        if v.is_finite() {
            Ok(FiniteCheck)
        } else {
            Err(E::custom(format!("non-finite float {} has no JSON representation", v)))
        }
    }

    fn visit_str<E: de::Error>(self, _: &str) -> std::result::Result<FiniteCheck, E> {
        Ok(FiniteCheck)
    }

    fn visit_bytes<E: de::Error>(self, _: &[u8]) -> std::result::Result<FiniteCheck, E> {
        Ok(FiniteCheck)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<FiniteCheck, E> {
        Ok(FiniteCheck)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<FiniteCheck, D::Error> {
        FiniteCheck::deserialize(deserializer)
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<FiniteCheck, E> {
        Ok(FiniteCheck)
    }

    fn visit_newtype_struct<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<FiniteCheck, D::Error> {
        FiniteCheck::deserialize(deserializer)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<FiniteCheck, A::Error> {
        while seq.next_element::<FiniteCheck>()?.is_some() {}
        Ok(FiniteCheck)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<FiniteCheck, A::Error> {
        while map.next_entry::<FiniteCheck, FiniteCheck>()?.is_some() {}
        Ok(FiniteCheck)
    }
}

#[derive(Serialize)]
struct CallRef<'a> {
    method: &'a str,
    kwargs: &'a Kwargs,
}

/// Encode `method(**kwargs)` into a state blob.
pub fn dump_call(method: &str, kwargs: &Kwargs) -> Result<State> {
    if method.is_empty() {
        return Err(Error::encoding("method name cannot be empty"));
    }
    rmp_serde::to_vec_named(&CallRef { method, kwargs })
        .map(|buf| State(Bytes::from(buf)))
        .map_err(|e| Error::encoding(format!("call {}: {}", method, e)))
}

/// Decode a state blob back into a call.
pub fn load_call(state: &State) -> Result<Call> {
    rmp_serde::from_slice(state.as_bytes())
        .map_err(|e| Error::encoding(format!("corrupt call state: {}", e)))
}

/// Encode a frame stack.
pub fn dump_stack(frames: &[Frame]) -> Result<Bytes> {
    rmp_serde::to_vec_named(frames)
        .map(Bytes::from)
        .map_err(|e| Error::encoding(format!("frame stack: {}", e)))
}

/// Decode a frame stack. An empty blob is an empty stack.
pub fn load_stack(bytes: &[u8]) -> Result<Vec<Frame>> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    rmp_serde::from_slice(bytes).map_err(|e| Error::encoding(format!("corrupt frame stack: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_dump_and_load_call() {
        let call = Call::new("f").arg("x", &5).unwrap().arg("name", "n").unwrap();
        let state = call.dump().unwrap();
        assert_eq!(load_call(&state).unwrap(), call);
    }

    #[test]
    fn test_dump_is_deterministic_regardless_of_insertion_order() {
        let a = Call::new("f").arg("a", &1).unwrap().arg("b", &json!({"z": 1, "y": 2})).unwrap();
        let b = Call::new("f").arg("b", &json!({"y": 2, "z": 1})).unwrap().arg("a", &1).unwrap();
        assert_eq!(a.dump().unwrap(), b.dump().unwrap());
    }

    #[test]
    fn test_empty_method_is_encoding_error() {
        let err = dump_call("", &Kwargs::new()).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn test_unserializable_argument_is_encoding_error() {
        let mut bad: HashMap<(i32, i32), i32> = HashMap::new();
        bad.insert((1, 2), 3);
        let err = Call::new("f").arg("bad", &bad).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn test_non_finite_floats_are_encoding_errors() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = Call::new("f").arg("x", &value).unwrap_err();
            assert!(matches!(err, Error::Encoding(_)), "{} gave {:?}", value, err);
        }
        let nested = json!({"ok": 1.5});
        assert!(Call::new("f").arg("x", &nested).is_ok());
        assert!(Call::new("f").arg("x", &vec![1.0_f32, f32::NAN]).is_err());
        assert!(Call::new("f").arg("x", &Some(f64::INFINITY)).is_err());

        let call = Call::new("f").arg("x", &0.25_f64).unwrap();
        let decoded = load_call(&call.dump().unwrap()).unwrap();
        assert_eq!(decoded.kwargs.get("x"), Some(&json!(0.25)));
    }

    #[test]
    fn test_corrupt_state_is_encoding_error() {
        let err = load_call(&State::from_bytes(vec![0xc1, 0x00])).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
    }

    #[test]
    fn test_stack_round_trip_and_empty_stack() {
        let frames = vec![Frame::new(Call::new("after").arg("k", &1).unwrap(), "result")];
        let bytes = dump_stack(&frames).unwrap();
        assert_eq!(load_stack(&bytes).unwrap(), frames);
        assert!(load_stack(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_frame_resume_with_inserts_result() {
        let frame = Frame::new(Call::new("after").arg("k", &1).unwrap(), "total");
        let call = frame.resume_with(json!(42));
        assert_eq!(call.method, "after");
        assert_eq!(call.kwargs.get("total"), Some(&json!(42)));
        assert_eq!(call.kwargs.get("k"), Some(&json!(1)));
    }

    proptest! {
        #[test]
        fn prop_dump_call_is_byte_identical(
            method in "[a-z][a-z_.]{0,16}",
            args in proptest::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..8),
        ) {
            let kwargs: Kwargs = args.into_iter().map(|(k, v)| (k, json!(v))).collect();
            let first = dump_call(&method, &kwargs).unwrap();
            let second = dump_call(&method, &kwargs).unwrap();
            prop_assert_eq!(first.as_bytes(), second.as_bytes());

            let reencoded = load_call(&first).unwrap().dump().unwrap();
            prop_assert_eq!(reencoded.as_bytes(), first.as_bytes());
        }
    }
}
