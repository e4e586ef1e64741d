//! Build script for shadowheap.
//!
//! Warns about feature combinations that silence memory error reports.

use std::env;

fn main() {
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_LOG");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_DIAGNOSTICS");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_PARKING_LOT");

    let log_enabled = env::var("CARGO_FEATURE_LOG").is_ok();
    let diagnostics_enabled = env::var("CARGO_FEATURE_DIAGNOSTICS").is_ok();
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());

    if profile == "release" && !log_enabled && !diagnostics_enabled {
        emit_warning("release build without 'log' or 'diagnostics': reports only reach callbacks");
        emit_note("Enable one of them to see reports:");
        emit_note("  shadowheap = { version = \"0.1\", features = [\"diagnostics\"] }");
    }

    let target = env::var("TARGET").unwrap_or_default();
    if target.contains("wasm") {
        emit_warning("WebAssembly target detected");
        emit_note("The default 64 MB arena may not fit; use HeapConfig::minimal()");
    }
}

fn emit_warning(msg: &str) {
    println!("cargo:warning=[shadowheap] {}", msg);
}

fn emit_note(msg: &str) {
    println!("cargo:warning=[shadowheap]    {}", msg);
}
