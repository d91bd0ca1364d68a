use wasm_bindgen::prelude::*;
use wasm_bindgen::JsValue;

#[macro_use]
mod browser;
mod engine;
mod game;

use engine::GameLoop;
use game::TreasureHunter;

/// Main entry for the Webassembly module
/// - installs the panic hook
/// - spawns the game loop on the local task queue
#[wasm_bindgen]
pub fn main_js() -> Result<(), JsValue> {
    // setup better panic messages for debugging
    console_error_panic_hook::set_once();

    // single threaded environment : local spawn, no Send bound
    browser::spawn_local(async move {
        GameLoop::start(TreasureHunter::new())
            .await
            .expect("Could not start game loop");
    });

    Ok(())
}
