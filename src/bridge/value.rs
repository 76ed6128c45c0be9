//! Host-side representation of values crossing the guest boundary.

use std::collections::BTreeMap;
use std::fmt;

use rquickjs::{
    function::This, Array, ArrayBuffer, Ctx, FromJs, IntoJs, Null, Object, Type, TypedArray, Value,
};

/// Upper bound on values visited while marshalling one guest value.
const MAX_NODES: usize = 100_000;
/// Upper bound on nesting depth.
const MAX_DEPTH: usize = 256;

/// A guest value copied into host memory.
///
/// `Bytes` is the host view of a `Uint8Array` / `ArrayBuffer`; everything
/// else mirrors the JSON data model plus `undefined`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HostValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<HostValue>),
    Object(BTreeMap<String, HostValue>),
}

impl HostValue {
    pub fn is_nullish(&self) -> bool {
        matches!(self, HostValue::Undefined | HostValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Property lookup on objects; `None` for any other variant.
    pub fn get(&self, key: &str) -> Option<&HostValue> {
        match self {
            HostValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// The JavaScript `typeof`-style name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Bytes(_) => "Uint8Array",
            HostValue::Array(_) => "Array",
            HostValue::Object(_) => "object",
        }
    }

    /// Convert into JSON. `undefined` becomes `null`, bytes become an array
    /// of numbers.
    pub fn into_json(self) -> serde_json::Value {
        match self {
            HostValue::Undefined | HostValue::Null => serde_json::Value::Null,
            HostValue::Bool(b) => serde_json::Value::Bool(b),
            HostValue::Number(n) => number_to_json(n),
            HostValue::String(s) => serde_json::Value::String(s),
            HostValue::Bytes(bytes) => {
                serde_json::Value::Array(bytes.into_iter().map(serde_json::Value::from).collect())
            }
            HostValue::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(HostValue::into_json).collect())
            }
            HostValue::Object(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into_json())).collect(),
            ),
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => HostValue::Null,
            serde_json::Value::Bool(b) => HostValue::Bool(b),
            serde_json::Value::Number(n) => HostValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => HostValue::String(s),
            serde_json::Value::Array(items) => {
                HostValue::Array(items.into_iter().map(HostValue::from).collect())
            }
            serde_json::Value::Object(map) => {
                HostValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        HostValue::String(value.to_string())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        HostValue::String(value)
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        HostValue::Bool(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        HostValue::Number(value)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(value: Vec<u8>) -> Self {
        HostValue::Bytes(value)
    }
}

/// Renders like a compact `JSON.stringify`, with `undefined` spelled out.
impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Undefined => f.write_str("undefined"),
            HostValue::Bytes(bytes) => write!(f, "Uint8Array({})", bytes.len()),
            HostValue::Array(items) => {
                f.write_str("[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            HostValue::Object(map) => {
                f.write_str("{")?;
                for (idx, (key, value)) in map.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}:{value}", serde_json::Value::String(key.clone()))?;
                }
                f.write_str("}")
            }
            other => write!(f, "{}", other.clone().into_json()),
        }
    }
}

/// A guest value that cannot be represented on the host side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarshalError {
    #[error("cannot transfer a value of type {0} across the sandbox boundary")]
    Unsupported(&'static str),
    #[error("cannot transfer a circular structure across the sandbox boundary")]
    Circular,
    #[error("value exceeds the sandbox transfer limits")]
    TooLarge,
    #[error("failed to read guest value: {0}")]
    Engine(String),
}

/// How guest values are interpreted while marshalling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarshalMode {
    /// Arguments to host functions: `undefined` is preserved.
    Arguments,
    /// `JSON.stringify` semantics: `toJSON` is honoured, `undefined`
    /// properties are dropped, non-finite numbers become `null`.
    Json,
}

struct Marshaller<'a, 'js> {
    ctx: &'a Ctx<'js>,
    mode: MarshalMode,
    ancestors: Vec<Value<'js>>,
    visited: usize,
}

impl<'a, 'js> Marshaller<'a, 'js> {
    fn engine_error(&self, error: rquickjs::Error) -> MarshalError {
        if error.is_exception() {
            let thrown = self.ctx.catch();
            let message = thrown
                .get::<rquickjs::convert::Coerced<String>>()
                .map(|coerced| coerced.0)
                .unwrap_or_else(|_| error.to_string());
            return MarshalError::Engine(message);
        }
        MarshalError::Engine(error.to_string())
    }

    fn convert(&mut self, value: Value<'js>) -> Result<HostValue, MarshalError> {
        self.visited += 1;
        if self.visited > MAX_NODES || self.ancestors.len() > MAX_DEPTH {
            return Err(MarshalError::TooLarge);
        }

        match value.type_of() {
            Type::Uninitialized | Type::Undefined => Ok(HostValue::Undefined),
            Type::Null => Ok(HostValue::Null),
            Type::Bool => Ok(HostValue::Bool(value.as_bool().unwrap_or_default())),
            Type::Int | Type::Float => {
                let n = value.as_number().unwrap_or(f64::NAN);
                if self.mode == MarshalMode::Json && !n.is_finite() {
                    Ok(HostValue::Null)
                } else {
                    Ok(HostValue::Number(n))
                }
            }
            Type::String => value
                .get::<String>()
                .map(HostValue::String)
                .map_err(|e| self.engine_error(e)),
            Type::Function | Type::Constructor => Err(MarshalError::Unsupported("function")),
            Type::Symbol => Err(MarshalError::Unsupported("symbol")),
            Type::BigInt => Err(MarshalError::Unsupported("bigint")),
            Type::Promise => Err(MarshalError::Unsupported("Promise")),
            Type::Array => self.nested(value, Self::convert_array),
            Type::Object | Type::Exception => self.nested(value, Self::convert_object),
            _ => Err(MarshalError::Unsupported("unknown")),
        }
    }

    fn nested(
        &mut self,
        value: Value<'js>,
        convert: fn(&mut Self, Value<'js>) -> Result<HostValue, MarshalError>,
    ) -> Result<HostValue, MarshalError> {
        if self.ancestors.iter().any(|ancestor| ancestor == &value) {
            return Err(MarshalError::Circular);
        }
        self.ancestors.push(value.clone());
        let converted = convert(self, value);
        self.ancestors.pop();
        converted
    }

    fn convert_array(&mut self, value: Value<'js>) -> Result<HostValue, MarshalError> {
        let array = Array::from_js(self.ctx, value).map_err(|e| self.engine_error(e))?;
        let mut items = Vec::with_capacity(array.len());
        for idx in 0..array.len() {
            let item: Value<'js> = array.get(idx).map_err(|e| self.engine_error(e))?;
            let converted = self.convert(item)?;
            items.push(match converted {
                HostValue::Undefined if self.mode == MarshalMode::Json => HostValue::Null,
                other => other,
            });
        }
        Ok(HostValue::Array(items))
    }

    fn convert_object(&mut self, value: Value<'js>) -> Result<HostValue, MarshalError> {
        if let Ok(bytes) = TypedArray::<u8>::from_js(self.ctx, value.clone()) {
            return Ok(HostValue::Bytes(
                bytes.as_bytes().map(<[u8]>::to_vec).unwrap_or_default(),
            ));
        }
        if let Ok(buffer) = ArrayBuffer::from_js(self.ctx, value.clone()) {
            return Ok(HostValue::Bytes(
                buffer.as_bytes().map(<[u8]>::to_vec).unwrap_or_default(),
            ));
        }

        let object = Object::from_js(self.ctx, value).map_err(|e| self.engine_error(e))?;

        if self.mode == MarshalMode::Json {
            let to_json: Value<'js> = object.get("toJSON").map_err(|e| self.engine_error(e))?;
            if let Some(to_json) = to_json.as_function() {
                let replaced: Value<'js> = to_json
                    .call((This(object.clone()), ""))
                    .map_err(|e| self.engine_error(e))?;
                if replaced.as_object().is_some_and(|o| o.as_value() == object.as_value()) {
                    return self.convert_properties(object);
                }
                return self.convert(replaced);
            }
        }

        self.convert_properties(object)
    }

    fn convert_properties(&mut self, object: Object<'js>) -> Result<HostValue, MarshalError> {
        let mut map = BTreeMap::new();
        for entry in object.props::<String, Value<'js>>() {
            let (key, item) = entry.map_err(|e| self.engine_error(e))?;
            match self.convert(item)? {
                HostValue::Undefined if self.mode == MarshalMode::Json => {}
                converted => {
                    map.insert(key, converted);
                }
            }
        }
        Ok(HostValue::Object(map))
    }
}

/// Copy a guest value into host memory.
pub fn from_js<'js>(
    ctx: &Ctx<'js>,
    value: Value<'js>,
    mode: MarshalMode,
) -> Result<HostValue, MarshalError> {
    Marshaller {
        ctx,
        mode,
        ancestors: Vec::new(),
        visited: 0,
    }
    .convert(value)
}

/// Deep-clone a guest value through JSON semantics, rejecting anything JSON
/// would silently drop or choke on (functions, symbols, cycles).
pub fn to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<serde_json::Value, MarshalError> {
    from_js(ctx, value, MarshalMode::Json).map(HostValue::into_json)
}

impl<'js> IntoJs<'js> for HostValue {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        match self {
            HostValue::Undefined => ().into_js(ctx),
            HostValue::Null => Null.into_js(ctx),
            HostValue::Bool(b) => b.into_js(ctx),
            HostValue::Number(n) => n.into_js(ctx),
            HostValue::String(s) => s.into_js(ctx),
            HostValue::Bytes(bytes) => TypedArray::<u8>::new(ctx.clone(), bytes)?.into_js(ctx),
            HostValue::Array(items) => {
                let array = Array::new(ctx.clone())?;
                for (idx, item) in items.into_iter().enumerate() {
                    array.set(idx, item)?;
                }
                array.into_js(ctx)
            }
            HostValue::Object(map) => {
                let object = Object::new(ctx.clone())?;
                for (key, item) in map {
                    object.set(key, item)?;
                }
                object.into_js(ctx)
            }
        }
    }
}
