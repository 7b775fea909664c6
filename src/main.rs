#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

fn main() {
    crypto_stream_lib::run();
}
