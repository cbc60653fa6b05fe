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

//! Display utilities.

use std::error::Error;
use std::fmt::Write;

/// Extension methods for [`std::error::Error`].
pub trait ErrorExt: Error {
    /// Formats the error followed by every error in its source chain,
    /// separated by `: `.
    ///
    /// Status fields on custom resources are the only place users see
    /// operator errors, so they must carry the full chain rather than only
    /// the outermost message.
    fn display_with_causes(&self) -> String {
        let mut out = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            // Transparent wrappers repeat their inner message verbatim.
            let msg = cause.to_string();
            if !out.ends_with(&msg) {
                write!(out, ": {msg}").expect("writing to a string cannot fail");
            }
            source = cause.source();
        }
        out
    }
}

impl<E: Error + ?Sized> ErrorExt for E {}
