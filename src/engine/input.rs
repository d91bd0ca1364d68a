use crate::browser;
use anyhow::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use wasm_bindgen::closure::Closure;
use web_sys::KeyboardEvent;

/// Press/release callbacks fire on the edge, never on OS key-repeat
type KeyCallback = Box<dyn FnMut()>;

struct Key {
    is_down: bool,
    on_press: Option<KeyCallback>,
    on_release: Option<KeyCallback>,
}

impl Key {
    fn new() -> Self {
        Key {
            is_down: false,
            on_press: None,
            on_release: None,
        }
    }
}

/// Handle to one tracked key, shared between the tracker and whoever wired
/// the callbacks. Cloning is cheap (Rc).
#[derive(Clone)]
pub struct KeyHandle(Rc<RefCell<Key>>);

impl KeyHandle {
    fn new() -> Self {
        KeyHandle(Rc::new(RefCell::new(Key::new())))
    }

    pub fn is_down(&self) -> bool {
        self.0.borrow().is_down
    }

    pub fn on_press(&self, callback: impl FnMut() + 'static) {
        self.0.borrow_mut().on_press = Some(Box::new(callback));
    }

    pub fn on_release(&self, callback: impl FnMut() + 'static) {
        self.0.borrow_mut().on_release = Some(Box::new(callback));
    }

    #[cfg(test)]
    fn same_key(&self, other: &KeyHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Maps key codes ("ArrowLeft", ...) to pressed/released state with
/// edge-triggered callbacks. Pure : knows nothing about the DOM, so the
/// whole contract is testable off-browser. `Keyboard` below does the
/// window wiring.
pub struct KeyTracker {
    keys: HashMap<String, KeyHandle>,
}

impl KeyTracker {
    pub fn new() -> Self {
        KeyTracker {
            keys: HashMap::new(),
        }
    }

    /// Idempotent per code : registering the same code twice returns the
    /// same handle.
    pub fn register(&mut self, code: &str) -> KeyHandle {
        self.keys
            .entry(code.to_string())
            .or_insert_with(KeyHandle::new)
            .clone()
    }

    /// Raw key-down entry point. Returns whether the code was tracked so
    /// the caller can consume the platform event. Repeated downs while
    /// already down do not re-fire on-press (OS key-repeat guard).
    ///
    /// On-press runs first, then the key is marked down : a callback
    /// reading its own handle still sees the key up.
    pub fn key_down(&self, code: &str) -> bool {
        let Some(handle) = self.keys.get(code) else {
            return false;
        };
        let callback = {
            let mut key = handle.0.borrow_mut();
            if key.is_down {
                None
            } else {
                key.on_press.take()
            }
        };
        Self::fire(handle, callback, Slot::Press);
        handle.0.borrow_mut().is_down = true;
        true
    }

    /// Raw key-up entry point, mirror of `key_down` : on-release fires only
    /// if the key was previously down, and runs before the key is marked up.
    pub fn key_up(&self, code: &str) -> bool {
        let Some(handle) = self.keys.get(code) else {
            return false;
        };
        let callback = {
            let mut key = handle.0.borrow_mut();
            if key.is_down {
                key.on_release.take()
            } else {
                None
            }
        };
        Self::fire(handle, callback, Slot::Release);
        handle.0.borrow_mut().is_down = false;
        true
    }

    // The callback is taken out of the key record before the call so the
    // record is not borrowed while user code runs (a callback may read its
    // own handle, or a sibling's). Restored afterwards unless the callback
    // installed a replacement.
    fn fire(handle: &KeyHandle, callback: Option<KeyCallback>, slot: Slot) {
        if let Some(mut callback) = callback {
            callback();
            let mut key = handle.0.borrow_mut();
            let slot = match slot {
                Slot::Press => &mut key.on_press,
                Slot::Release => &mut key.on_release,
            };
            if slot.is_none() {
                *slot = Some(callback);
            }
        }
    }
}

enum Slot {
    Press,
    Release,
}

impl Default for KeyTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Browser-facing wrapper : one pair of window keydown/keyup listeners
/// feeding a shared `KeyTracker`. Owns its subscribe/unsubscribe lifecycle;
/// `destroy()` (or drop) releases both listeners. Tracked events are
/// consumed with `preventDefault` so arrow keys do not also scroll the page.
pub struct Keyboard {
    tracker: Rc<RefCell<KeyTracker>>,
    keydown: Option<Closure<dyn FnMut(KeyboardEvent)>>,
    keyup: Option<Closure<dyn FnMut(KeyboardEvent)>>,
}

impl Keyboard {
    pub fn attach() -> Result<Self> {
        let tracker = Rc::new(RefCell::new(KeyTracker::new()));

        let keydown = {
            let tracker = tracker.clone();
            Closure::wrap(Box::new(move |event: KeyboardEvent| {
                if tracker.borrow().key_down(&event.code()) {
                    event.prevent_default();
                }
            }) as Box<dyn FnMut(KeyboardEvent)>)
        };
        let keyup = {
            let tracker = tracker.clone();
            Closure::wrap(Box::new(move |event: KeyboardEvent| {
                if tracker.borrow().key_up(&event.code()) {
                    event.prevent_default();
                }
            }) as Box<dyn FnMut(KeyboardEvent)>)
        };

        browser::add_keyboard_listener("keydown", &keydown)?;
        if let Err(err) = browser::add_keyboard_listener("keyup", &keyup) {
            // don't leave the half-wired keydown handler on the window
            let _ = browser::remove_keyboard_listener("keydown", &keydown);
            return Err(err);
        }

        Ok(Keyboard {
            tracker,
            keydown: Some(keydown),
            keyup: Some(keyup),
        })
    }

    pub fn register(&self, code: &str) -> KeyHandle {
        self.tracker.borrow_mut().register(code)
    }

    pub fn destroy(&mut self) {
        if let Some(keydown) = self.keydown.take() {
            let _ = browser::remove_keyboard_listener("keydown", &keydown);
        }
        if let Some(keyup) = self.keyup.take() {
            let _ = browser::remove_keyboard_listener("keyup", &keyup);
        }
    }
}

impl Drop for Keyboard {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn register_is_idempotent_per_code() {
        let mut tracker = KeyTracker::new();
        let first = tracker.register("ArrowLeft");
        let second = tracker.register("ArrowLeft");
        assert!(first.same_key(&second));

        let other = tracker.register("ArrowRight");
        assert!(!first.same_key(&other));
    }

    #[test]
    fn unregistered_codes_are_ignored() {
        let mut tracker = KeyTracker::new();
        tracker.register("ArrowLeft");
        assert!(!tracker.key_down("KeyW"));
        assert!(!tracker.key_up("KeyW"));
        assert!(tracker.key_down("ArrowLeft"));
    }

    #[test]
    fn press_fires_once_despite_key_repeat() {
        let mut tracker = KeyTracker::new();
        let key = tracker.register("ArrowUp");

        let presses = Rc::new(Cell::new(0));
        {
            let presses = presses.clone();
            key.on_press(move || presses.set(presses.get() + 1));
        }

        // OS key-repeat floods keydown while the key is held
        tracker.key_down("ArrowUp");
        tracker.key_down("ArrowUp");
        tracker.key_down("ArrowUp");

        assert_eq!(presses.get(), 1);
        assert!(key.is_down());
    }

    #[test]
    fn release_fires_only_if_previously_down() {
        let mut tracker = KeyTracker::new();
        let key = tracker.register("ArrowDown");

        let releases = Rc::new(Cell::new(0));
        {
            let releases = releases.clone();
            key.on_release(move || releases.set(releases.get() + 1));
        }

        // up without a preceding down : nothing fires
        tracker.key_up("ArrowDown");
        assert_eq!(releases.get(), 0);

        tracker.key_down("ArrowDown");
        tracker.key_up("ArrowDown");
        tracker.key_up("ArrowDown");
        assert_eq!(releases.get(), 1);
        assert!(!key.is_down());
    }

    #[test]
    fn press_release_cycle_fires_each_edge_again() {
        let mut tracker = KeyTracker::new();
        let key = tracker.register("Space");

        let presses = Rc::new(Cell::new(0));
        {
            let presses = presses.clone();
            key.on_press(move || presses.set(presses.get() + 1));
        }

        tracker.key_down("Space");
        tracker.key_up("Space");
        tracker.key_down("Space");
        assert_eq!(presses.get(), 2);
    }

    #[test]
    fn callback_may_read_sibling_key_state() {
        let mut tracker = KeyTracker::new();
        let left = tracker.register("ArrowLeft");
        let right = tracker.register("ArrowRight");

        let saw_right_down = Rc::new(Cell::new(false));
        {
            let saw_right_down = saw_right_down.clone();
            let right = right.clone();
            left.on_release(move || saw_right_down.set(right.is_down()));
        }

        tracker.key_down("ArrowRight");
        tracker.key_down("ArrowLeft");
        tracker.key_up("ArrowLeft");

        assert!(saw_right_down.get());
    }

    #[test]
    fn press_callback_sees_the_key_still_up() {
        let mut tracker = KeyTracker::new();
        let key = tracker.register("KeyA");

        let down_during_press = Rc::new(Cell::new(true));
        {
            let down_during_press = down_during_press.clone();
            let own = key.clone();
            key.on_press(move || down_during_press.set(own.is_down()));
        }

        tracker.key_down("KeyA");
        // invoke first, mark down second : the callback observes the
        // pre-transition state
        assert!(!down_during_press.get());
        assert!(key.is_down());
    }

    #[test]
    fn release_callback_sees_the_key_still_down() {
        let mut tracker = KeyTracker::new();
        let key = tracker.register("KeyA");

        let down_during_release = Rc::new(Cell::new(false));
        {
            let down_during_release = down_during_release.clone();
            let own = key.clone();
            key.on_release(move || down_during_release.set(own.is_down()));
        }

        tracker.key_down("KeyA");
        tracker.key_up("KeyA");
        assert!(down_during_release.get());
        assert!(!key.is_down());
    }
}
