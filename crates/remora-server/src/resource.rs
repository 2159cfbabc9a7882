// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The [`Resource`] trait and its explicit route table.
//!
//! A resource type lists its business methods once, in [`Resource::routes`].
//! Each entry names the method, decodes its JSON arguments into a typed
//! struct, and declares how the return value travels:
//!
//! | Kind      | Transport          | Body                         |
//! |-----------|--------------------|------------------------------|
//! | `unary`   | `POST /<name>`     | `{"response": value}`        |
//! | `mapping` | `POST /<name>`     | the returned mapping as is   |
//! | `stream`  | `WS /<name>?data=` | `{"response": item}*` + end  |

use std::collections::BTreeMap;
use std::sync::Arc;

use remora_protocol::{Envelope, ResourceDescriptor};
use schemars::JsonSchema;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ResourceError, Result};

/// Names served by the server itself; resource methods cannot shadow them.
pub const RESERVED_ROUTES: &[&str] = &[
    "health", "info", "labels", "schema", "lock", "unlock", "save", "load", "logs", "diff",
    "merge",
];

/// A type that can be hosted by a resource server.
///
/// The type itself is its saved state: `save` serializes the whole value and
/// `load` deserializes it back.
pub trait Resource: Serialize + DeserializeOwned + Send + 'static {
    /// Constructor parameters, mounted as `config.json` or passed on the command line.
    type Params: DeserializeOwned + Serialize + JsonSchema + Default + Send;

    /// Type name reported by `info` and used to derive image tags.
    const NAME: &'static str;

    /// Server entrypoint relative to the repository root.
    const SERVER_PATH: &'static str;

    /// Construct from parameters.
    fn new(params: Self::Params) -> Self;

    /// Register business methods.
    fn routes(table: &mut RouteTable<Self>);

    /// Names of the types this resource builds on, most specific first.
    fn bases() -> Vec<String> {
        vec![Self::NAME.to_string(), "Resource".to_string()]
    }

    /// Metadata published on images and pods.
    fn descriptor() -> ResourceDescriptor {
        let schema = serde_json::to_value(schemars::schema_for!(Self::Params))
            .unwrap_or(Value::Null);
        ResourceDescriptor::new(Self::NAME, Self::SERVER_PATH)
            .with_bases(Self::bases())
            .with_params_schema(schema)
    }
}

type CallFn<R> = dyn Fn(&mut R, Value) -> Result<Value> + Send + Sync;
type StreamFn<R> = dyn Fn(&mut R, Value) -> Result<ItemStream> + Send + Sync;

/// Items produced by a streaming method, already converted to JSON.
pub type ItemStream = Box<dyn Iterator<Item = Result<Value>> + Send>;

/// A registered method.
pub enum Route<R> {
    /// Request/response method.
    Call(Arc<CallFn<R>>),
    /// Streaming method, served over WebSocket.
    Stream(Arc<StreamFn<R>>),
}

impl<R> Clone for Route<R> {
    fn clone(&self) -> Self {
        match self {
            Route::Call(f) => Route::Call(Arc::clone(f)),
            Route::Stream(f) => Route::Stream(Arc::clone(f)),
        }
    }
}

/// Business methods of one resource type.
pub struct RouteTable<R> {
    routes: BTreeMap<String, Route<R>>,
}

impl<R: Resource> RouteTable<R> {
    /// Build the table for `R`.
    pub fn for_resource() -> Self {
        let mut table = Self {
            routes: BTreeMap::new(),
        };
        R::routes(&mut table);
        table
    }

    /// Register a method whose return value is wrapped in `{"response": ...}`.
    pub fn unary<A, T, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned,
        T: Serialize,
        F: Fn(&mut R, A) -> Result<T> + Send + Sync + 'static,
    {
        self.insert(
            name,
            Route::Call(Arc::new(move |resource: &mut R, args: Value| {
                let out = f(resource, decode_args(args)?)?;
                Ok(serde_json::to_value(Envelope::new(out))?)
            })),
        )
    }

    /// Register a method whose return value is a mapping sent unwrapped.
    pub fn mapping<A, T, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned,
        T: Serialize,
        F: Fn(&mut R, A) -> Result<T> + Send + Sync + 'static,
    {
        self.insert(
            name,
            Route::Call(Arc::new(move |resource: &mut R, args: Value| {
                let out = f(resource, decode_args(args)?)?;
                Ok(serde_json::to_value(out)?)
            })),
        )
    }

    /// Register a method returning a sequence of items.
    ///
    /// The iterator is created while the instance is held and drained after it
    /// is released, so it must own everything it reads.
    pub fn stream<A, T, I, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: DeserializeOwned,
        T: Serialize,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        F: Fn(&mut R, A) -> Result<I> + Send + Sync + 'static,
    {
        self.insert(
            name,
            Route::Stream(Arc::new(move |resource: &mut R, args: Value| {
                let items = f(resource, decode_args(args)?)?.into_iter();
                let stream: ItemStream = Box::new(
                    items.map(|item| serde_json::to_value(item).map_err(ResourceError::from)),
                );
                Ok(stream)
            })),
        )
    }

    fn insert(&mut self, name: &str, route: Route<R>) -> &mut Self {
        if RESERVED_ROUTES.contains(&name) {
            tracing::warn!(method = name, "method name is reserved, not registered");
            return self;
        }
        self.routes.insert(name.to_string(), route);
        self
    }
}

impl<R> RouteTable<R> {
    /// Look up a method.
    pub fn get(&self, name: &str) -> Option<&Route<R>> {
        self.routes.get(name)
    }

    /// Iterate over registered methods in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Route<R>)> {
        self.routes.iter().map(|(name, route)| (name.as_str(), route))
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no methods are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn decode_args<A: DeserializeOwned>(args: Value) -> Result<A> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args).map_err(|e| ResourceError::BadRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::Bar;
    use serde_json::json;

    fn call(table: &RouteTable<Bar>, bar: &mut Bar, name: &str, args: Value) -> Result<Value> {
        match table.get(name) {
            Some(Route::Call(f)) => f(bar, args),
            _ => panic!("{name} is not a call route"),
        }
    }

    #[test]
    fn test_unary_wraps_response() {
        let table = RouteTable::<Bar>::for_resource();
        let mut bar = Bar::new(Default::default());
        let out = call(&table, &mut bar, "add", json!({"x": 1, "y": 3})).unwrap();
        assert_eq!(out, json!({"response": 4}));
    }

    #[test]
    fn test_bad_arguments_are_rejected() {
        let table = RouteTable::<Bar>::for_resource();
        let mut bar = Bar::new(Default::default());
        let err = call(&table, &mut bar, "add", json!({"x": "one"})).unwrap_err();
        assert!(matches!(err, ResourceError::BadRequest(_)));
    }

    #[test]
    fn test_stream_route_yields_items() {
        let table = RouteTable::<Bar>::for_resource();
        let mut bar = Bar::new(Default::default());
        let Some(Route::Stream(f)) = table.get("stream") else {
            panic!("stream route missing");
        };
        let items: Vec<Value> = f(&mut bar, json!({"a": "x", "num": 3}))
            .unwrap()
            .map(|i| i.unwrap())
            .collect();
        assert_eq!(items, vec![json!("0: x"), json!("1: x"), json!("2: x")]);
    }

    #[test]
    fn test_reserved_names_are_skipped() {
        let mut table = RouteTable::<Bar>::for_resource();
        let before = table.len();
        table.unary("lock", |_: &mut Bar, _: remora_protocol::NoArgs| Ok(()));
        assert_eq!(table.len(), before);
    }

    #[test]
    fn test_descriptor_carries_schema() {
        let descriptor = Bar::descriptor();
        assert_eq!(descriptor.name, "Bar");
        assert_eq!(descriptor.bases, vec!["Bar", "Resource"]);
        assert!(descriptor.params_schema["properties"].get("a").is_some());
    }
}
