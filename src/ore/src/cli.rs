// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Command-line parsing utilities.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use clap::Parser;

/// A help template for use with clap that leaves out the binary name and
/// version, which are noise in operator deployment manifests.
const NO_VERSION_HELP_TEMPLATE: &str = "{about}

USAGE:
    {usage}

{all-args}";

/// Parses command-line arguments according to a clap [`Parser`] after
/// applying operator-wide customizations.
///
/// Later occurrences of an argument override earlier ones, so that values
/// baked into a container image can be overridden by the deployment.
pub fn parse_args<O>() -> O
where
    O: Parser,
{
    let command = O::command()
        .disable_version_flag(true)
        .args_override_self(true)
        .help_template(NO_VERSION_HELP_TEMPLATE);
    match O::from_arg_matches(&command.get_matches()) {
        Ok(args) => args,
        Err(e) => e.exit(),
    }
}

/// A command-line argument of the form `KEY=VALUE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueArg<K, V> {
    /// The key of the command-line argument.
    pub key: K,
    /// The value of the command-line argument.
    pub value: V,
}

impl<K, V> FromStr for KeyValueArg<K, V>
where
    K: FromStr,
    K::Err: Display,
    V: FromStr,
    V::Err: Display,
{
    type Err = String;

    fn from_str(s: &str) -> Result<KeyValueArg<K, V>, String> {
        let Some((key, value)) = s.split_once('=') else {
            return Err("must have format KEY=VALUE".to_string());
        };
        Ok(KeyValueArg {
            key: key.parse().map_err(|e| format!("parsing key: {}", e))?,
            value: value.parse().map_err(|e| format!("parsing value: {}", e))?,
        })
    }
}

/// Collects repeated `KEY=VALUE` arguments into a map, later keys winning.
///
/// This is the shape Kubernetes wants for node selectors and label sets.
pub fn key_value_map<K, V>(args: &[KeyValueArg<K, V>]) -> BTreeMap<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    args.iter()
        .map(|arg| (arg.key.clone(), arg.value.clone()))
        .collect()
}
