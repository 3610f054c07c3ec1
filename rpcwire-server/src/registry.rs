//! Method registry for dispatching calls by name.
//!
//! Methods are addressed as `"Service.Method"`. A handler is any async
//! function from a deserializable argument to a serializable reply or a
//! displayable error:
//!
//! ```ignore
//! let mut registry = Registry::new();
//! registry.register("Arith.Add", |args: (i64, i64)| async move {
//!     Ok::<_, String>(args.0 + args.1)
//! })?;
//! ```

use crate::error::ServerError;
use rpcwire_protocol::{JsonCodec, PayloadCodec, ProtocolError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

/// Boxed future for method results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of a call: the encoded reply, or the text for the response
/// header's error field.
pub type CallResult = Result<Vec<u8>, String>;

/// A registered method.
pub trait MethodHandler<P>: Send + Sync + 'static {
    /// Decodes the request body and starts the call.
    ///
    /// Decoding happens synchronously so that a bad body is reported before
    /// anything is spawned. The returned future owns everything it needs.
    fn prepare(&self, codec: &P, body: &[u8])
        -> Result<BoxFuture<'static, CallResult>, ProtocolError>;
}

/// Wrapper that decodes the argument and encodes the reply around an async
/// function.
pub struct TypedHandler<F, Req, Resp, E, Fut> {
    handler: F,
    _phantom: PhantomData<fn(Req) -> (Fut, Resp, E)>,
}

impl<F, Req, Resp, E, Fut> TypedHandler<F, Req, Resp, E, Fut>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, E>> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<P, F, Req, Resp, E, Fut> MethodHandler<P> for TypedHandler<F, Req, Resp, E, Fut>
where
    P: PayloadCodec,
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    E: Display + Send + 'static,
    Fut: Future<Output = Result<Resp, E>> + Send + 'static,
{
    fn prepare(
        &self,
        codec: &P,
        body: &[u8],
    ) -> Result<BoxFuture<'static, CallResult>, ProtocolError> {
        let args: Req = codec.decode(body)?;
        let fut = (self.handler)(args);
        let codec = codec.clone();

        Ok(Box::pin(async move {
            let reply = fut.await.map_err(|e| e.to_string())?;
            codec
                .encode(&reply)
                .map_err(|e| format!("rpc: encoding response: {}", error_detail(e)))
        }))
    }
}

/// Strips the variant prefix from payload errors for use in call errors.
pub(crate) fn error_detail(err: ProtocolError) -> String {
    match err {
        ProtocolError::PayloadDecode(detail) | ProtocolError::PayloadEncode(detail) => detail,
        other => other.to_string(),
    }
}

/// Checks that `name` is `"Service.Method"` with both parts non-empty.
fn validate_method_name(name: &str) -> Result<(), ServerError> {
    match name.split_once('.') {
        Some((service, method))
            if !service.is_empty() && !method.is_empty() && !method.contains('.') =>
        {
            Ok(())
        }
        _ => Err(ServerError::InvalidMethodName(name.to_string())),
    }
}

/// Registry mapping method names to handlers.
///
/// The registry also owns the payload codec used for request arguments and
/// replies on every connection it serves.
pub struct Registry<P = JsonCodec> {
    codec: P,
    methods: HashMap<String, Box<dyn MethodHandler<P>>>,
}

impl Registry<JsonCodec> {
    /// Creates an empty registry with JSON payloads.
    pub fn new() -> Self {
        Self::with_codec(JsonCodec)
    }
}

impl Default for Registry<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PayloadCodec> Registry<P> {
    /// Creates an empty registry with a custom payload codec.
    pub fn with_codec(codec: P) -> Self {
        Self {
            codec,
            methods: HashMap::new(),
        }
    }

    /// Registers an async method handler under `name`.
    pub fn register<F, Req, Resp, E, Fut>(&mut self, name: &str, handler: F) -> Result<(), ServerError>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: Display + Send + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    {
        self.register_handler(name, TypedHandler::new(handler))
    }

    /// Registers a prebuilt handler under `name`.
    pub fn register_handler<H>(&mut self, name: &str, handler: H) -> Result<(), ServerError>
    where
        H: MethodHandler<P>,
    {
        validate_method_name(name)?;
        if self.methods.contains_key(name) {
            return Err(ServerError::DuplicateMethod(name.to_string()));
        }
        tracing::debug!(method = name, "registered method");
        self.methods.insert(name.to_string(), Box::new(handler));
        Ok(())
    }

    /// Looks up a handler by method name.
    pub fn get(&self, name: &str) -> Option<&dyn MethodHandler<P>> {
        self.methods.get(name).map(|h| h.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Returns the registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn payload_codec(&self) -> &P {
        &self.codec
    }
}

impl<P> std::fmt::Debug for Registry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.methods.keys().collect();
        names.sort();
        f.debug_struct("Registry").field("methods", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct AddArgs {
        a: i64,
        b: i64,
    }

    fn arith_registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register("Arith.Add", |args: AddArgs| async move {
                Ok::<_, String>(args.a + args.b)
            })
            .unwrap();
        registry
            .register("Arith.Divide", |args: AddArgs| async move {
                if args.b == 0 {
                    Err("divide by zero".to_string())
                } else {
                    Ok(args.a / args.b)
                }
            })
            .unwrap();
        registry
    }

    async fn call(registry: &Registry, method: &str, body: &[u8]) -> CallResult {
        let handler = registry.get(method).unwrap();
        handler
            .prepare(registry.payload_codec(), body)
            .unwrap()
            .await
    }

    #[tokio::test]
    async fn test_call_ok() {
        let registry = arith_registry();
        let reply = call(&registry, "Arith.Add", br#"{"a":2,"b":3}"#).await;
        assert_eq!(reply.unwrap(), b"5");
    }

    #[tokio::test]
    async fn test_call_error_text() {
        let registry = arith_registry();
        let reply = call(&registry, "Arith.Divide", br#"{"a":1,"b":0}"#).await;
        assert_eq!(reply.unwrap_err(), "divide by zero");
    }

    #[test]
    fn test_bad_argument_is_decode_error() {
        let registry = arith_registry();
        let handler = registry.get("Arith.Add").unwrap();
        let err = handler
            .prepare(registry.payload_codec(), br#"{"a":"x"}"#)
            .err()
            .unwrap();
        assert!(matches!(err, ProtocolError::PayloadDecode(_)));
    }

    #[tokio::test]
    async fn test_encode_failure_is_call_error() {
        use std::collections::HashMap;

        let mut registry = Registry::new();
        registry
            .register("Bad.Map", |_: ()| async move {
                // JSON object keys must be strings.
                let mut map = HashMap::new();
                map.insert(vec![1u8], 1);
                Ok::<_, String>(map)
            })
            .unwrap();

        let reply = call(&registry, "Bad.Map", b"null").await;
        let err = reply.unwrap_err();
        assert!(err.starts_with("rpc: encoding response: "), "{}", err);
    }

    #[test]
    fn test_method_name_validation() {
        let mut registry = Registry::new();
        for name in ["Echo", "", ".Say", "Echo.", "Echo.Say.Loud", "."] {
            let err = registry
                .register(name, |s: String| async move { Ok::<_, String>(s) })
                .unwrap_err();
            assert!(
                matches!(err, ServerError::InvalidMethodName(ref n) if n == name),
                "{:?}",
                name
            );
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_method() {
        let mut registry = arith_registry();
        let err = registry
            .register("Arith.Add", |args: AddArgs| async move {
                Ok::<_, String>(args.a - args.b)
            })
            .unwrap_err();
        assert!(matches!(err, ServerError::DuplicateMethod(_)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_methods_sorted() {
        let registry = arith_registry();
        assert_eq!(registry.methods(), vec!["Arith.Add", "Arith.Divide"]);
        assert!(registry.contains("Arith.Add"));
        assert!(!registry.contains("Arith.Mul"));
        assert!(registry.get("Arith.Mul").is_none());
    }
}
