// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `Bar`, a small resource used by the `bar-server` binary and the end-to-end tests.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, Result};
use crate::resource::{Resource, RouteTable};

/// Constructor parameters of [`Bar`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BarParams {
    /// A string field.
    pub a: String,
    /// A number field.
    pub b: i64,
}

/// A resource with two fields, a few unary methods and one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    a: String,
    b: i64,
}

/// Arguments of `echo`.
#[derive(Debug, Serialize, Deserialize)]
pub struct EchoArgs {
    pub txt: String,
}

/// Arguments of `add`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AddArgs {
    pub x: i64,
    pub y: i64,
}

/// Arguments of `stream`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamArgs {
    pub a: String,
    pub num: usize,
}

impl Bar {
    pub fn echo(&self, txt: &str) -> String {
        format!("{} -- hello! a: {} b: {}", txt, self.a, self.b)
    }

    pub fn add(&self, x: i64, y: i64) -> Result<i64> {
        x.checked_add(y)
            .ok_or_else(|| ResourceError::BadRequest(format!("{x} + {y} overflows")))
    }

    pub fn set(&mut self, a: String, b: i64) {
        self.a = a;
        self.b = b;
    }
}

impl Resource for Bar {
    type Params = BarParams;

    const NAME: &'static str = "Bar";
    const SERVER_PATH: &'static str = "crates/remora-server/src/bin/bar-server.rs";

    fn new(params: BarParams) -> Self {
        Self {
            a: params.a,
            b: params.b,
        }
    }

    fn routes(table: &mut RouteTable<Self>) {
        table
            .unary("echo", |bar: &mut Bar, args: EchoArgs| Ok(bar.echo(&args.txt)))
            .unary("add", |bar: &mut Bar, args: AddArgs| bar.add(args.x, args.y))
            .unary("set", |bar: &mut Bar, args: BarParams| -> Result<()> {
                bar.set(args.a, args.b);
                Ok(())
            })
            .stream("stream", |_: &mut Bar, args: StreamArgs| {
                let a = args.a;
                Ok((0..args.num).map(move |i| format!("{i}: {a}")))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_reflects_state() {
        let mut bar = Bar::new(BarParams {
            a: "baz".into(),
            b: 1,
        });
        bar.set("qoz".into(), 5);
        assert_eq!(bar.echo("yellow"), "yellow -- hello! a: qoz b: 5");
        assert_eq!(bar.add(1, 3).unwrap(), 4);
    }

    #[test]
    fn test_add_overflow_is_bad_request() {
        let bar = Bar::new(BarParams::default());
        let err = bar.add(i64::MAX, 1).unwrap_err();
        assert!(matches!(err, ResourceError::BadRequest(_)));
    }
}
