use crate::txn::entry::MAX_TIMESTAMP;
use crate::util::constants::{BYTES_IN_PAGE, BYTES_IN_WORD, MAX_CHUNKS};
use crate::txn::log::MAX_LOG_HANDLES;
use std::default::Default;

/// The largest number of workers that may hold safe timestamps at the same time.
pub const MAX_WORKERS: usize = 1 << 12;

fn always_valid<T>(_: &T) -> bool {
    true
}

fn valid_metadata_capacity(v: &usize) -> bool {
    v.is_power_of_two() && *v >= BYTES_IN_PAGE / BYTES_IN_WORD && (*v as u64) <= MAX_TIMESTAMP + 1
}

macro_rules! options {
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*,) => [
        options!($($name: $type[$validator] = $default),*);
    ];
    ($($name:ident: $type:ty[$validator:expr] = $default:expr),*) => [
        #[derive(Clone, Debug)]
        pub struct Options {
            $(pub $name: $type),*
        }
        impl Options {
            /// Set an option by its snake case name. Returns `false` and keeps the old value if
            /// the key is unknown, the value cannot be parsed, or the value fails validation.
            pub fn set_from_str(&mut self, s: &str, val: &str) -> bool {
                match s {
                    // Parse the given value from str (by env vars or by calling set_option()) to the right type
                    $(stringify!($name) => if let Ok(ref val) = val.parse::<$type>() {
                        // Validate
                        let validate_fn = $validator;
                        let is_valid = validate_fn(val);
                        if is_valid {
                            // Only set value if valid.
                            self.$name = val.clone();
                        } else {
                            warn!("Unable to set {}={:?}. Invalid value. Default value will be used.", s, val);
                        }
                        is_valid
                    } else {
                        warn!("Unable to set {}={:?}. Cant parse value. Default value will be used.", s, val);
                        false
                    })*
                    _ => {
                        warn!("Unknown option {}={:?}", s, val);
                        false
                    }
                }
            }
        }
        impl Default for Options {
            fn default() -> Self {
                let mut options = Options {
                    $($name: $default),*
                };

                // If we have env vars that start with TXCORE_ and match any option (such as TXCORE_CHUNK_COUNT),
                // we set the option to its value (if it is a valid value). Otherwise, use the default value.
                const PREFIX: &str = "TXCORE_";
                for (key, val) in std::env::vars() {
                    // strip the prefix, and get the lower case string
                    if let Some(rest_of_key) = key.strip_prefix(PREFIX) {
                        let lowercase: &str = &rest_of_key.to_lowercase();
                        match lowercase {
                            $(stringify!($name) => { options.set_from_str(lowercase, &val); },)*
                            _ => {}
                        }
                    }
                }
                options
            }
        }
    ]
}

options! {
    // Number of workers that can hold a session (and thus a safe timestamp index) at the same time.
    max_workers:           usize [|v: &usize| *v > 0 && *v <= MAX_WORKERS] = (num_cpus::get() * 4).min(MAX_WORKERS),
    // Number of entries in the transaction metadata table. Bounds the number of timestamps ever allocated:
    // registering a transaction past it panics. Defaults to every timestamp an entry can link to. The
    // table is reserved without backing, so only touched pages cost memory.
    txn_metadata_capacity: usize [valid_metadata_capacity] = (MAX_TIMESTAMP + 1) as usize,
    // Number of chunks in the managed address space, including the reserved chunk 0.
    chunk_count:           usize [|v: &usize| *v >= 2 && *v <= MAX_CHUNKS] = 1 << 10,
    // Number of transaction logs that can be live at the same time.
    max_txn_logs:          usize [|v: &usize| *v > 0 && *v <= MAX_LOG_HANDLES] = 1 << 14,
    // Should log GC wait for committed transactions to become durable?
    persistence:           bool  [always_valid] = false,
    // Should maintenance decommit metadata entries behind the pre-truncate watermark?
    truncate_txn_table:    bool  [always_valid] = true,
}

impl Options {
    /// Set an option by its camel case name, such as `chunkCount`.
    pub fn set_from_camelcase_str(&mut self, s: &str, val: &str) -> bool {
        trace!("Trying to process option pair: ({}, {})", s, val);

        let mut sr = String::with_capacity(s.len());
        for c in s.chars() {
            if c.is_uppercase() {
                sr.push('_');
                for c in c.to_lowercase() {
                    sr.push(c);
                }
            } else {
                sr.push(c)
            }
        }

        let result = self.set_from_str(sr.as_str(), val);
        if result {
            trace!("Validation passed");
        } else {
            trace!("Validation failed")
        }
        result
    }

    /// Set options from whitespace separated `key=value` pairs, e.g. `"max_workers=8 persistence=true"`.
    /// Returns `true` only if every pair was applied.
    pub fn set_bulk_from_str(&mut self, options: &str) -> bool {
        for opt in options.split_ascii_whitespace() {
            let kv_pair: Vec<&str> = opt.split('=').collect();
            if kv_pair.len() != 2 {
                warn!("Malformed option {:?}", opt);
                return false;
            }
            if !self.set_from_str(kv_pair[0], kv_pair[1]) {
                return false;
            }
        }
        true
    }
}
