use crate::browser;
use anyhow::{anyhow, Error, Result};
// ELI5: web assembly is a single threaded environment, so Rc RefCell > Mutex
use async_trait::async_trait;
use futures::channel::oneshot::channel;
use std::cell::RefCell;
use std::rc::Rc;
use wasm_bindgen::{
    // unchecked_ref (unsafe) cast from Javascript type to Rust type
    // - because we control the closure creation and specify the expected type,
    // in principle this should be generally safe (unsafe) code
    JsCast,
    JsValue,
};
use web_sys::{CanvasRenderingContext2d, HtmlImageElement};

pub mod input;

#[async_trait(?Send)]
pub trait Game {
    async fn initialize(&self) -> Result<Box<dyn Game>>;
    /// One tick of the simulation. `delta` is the fixed step length in
    /// milliseconds; movement is a fixed per-tick step and does not scale
    /// by it, so gameplay speed tracks the tick rate.
    fn update(&mut self, delta: f32);
    fn draw(&self, renderer: &Renderer);
}

// length of a frame in milliseconds
pub const FRAME_SIZE: f32 = 1.0 / 60.0 * 1000.0;

pub struct GameLoop {
    last_frame: f64,
    accumulated_delta: f32,
}

type SharedLoopClosure = Rc<RefCell<Option<browser::LoopClosure>>>;

impl GameLoop {
    pub async fn start(game: impl Game + 'static) -> Result<()> {
        let mut game = game.initialize().await?;
        let mut game_loop = GameLoop {
            last_frame: browser::now()?,
            accumulated_delta: 0.0,
        };
        let renderer = Renderer {
            context: browser::context()?,
        };
        let f: SharedLoopClosure = Rc::new(RefCell::new(None));
        let g = f.clone();
        *g.borrow_mut() = Some(browser::create_raf_closure(move |perf: f64| {
            game_loop.accumulated_delta += (perf - game_loop.last_frame) as f32;
            while game_loop.accumulated_delta > FRAME_SIZE {
                game.update(FRAME_SIZE);
                game_loop.accumulated_delta -= FRAME_SIZE;
            }
            game_loop.last_frame = perf;
            game.draw(&renderer);
            let _ = browser::request_animation_frame(f.borrow().as_ref().unwrap());
        }));

        browser::request_animation_frame(
            g.borrow()
                .as_ref()
                .ok_or_else(|| anyhow!("GameLoop: Loop is None"))?,
        )?;

        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.width / 2.0,
            y: self.y + self.height / 2.0,
        }
    }

    pub fn half_extents(&self) -> Point {
        Point {
            x: self.width / 2.0,
            y: self.height / 2.0,
        }
    }

    /// Strict axis-aligned overlap test. Boxes that touch exactly at an
    /// edge are NOT intersecting : edge-adjacency is "not yet colliding".
    pub fn intersects(&self, other: &Rect) -> bool {
        let center_a = self.center();
        let center_b = other.center();
        let half_a = self.half_extents();
        let half_b = other.half_extents();

        (center_a.x - center_b.x).abs() < half_a.x + half_b.x
            && (center_a.y - center_b.y).abs() < half_a.y + half_b.y
    }
}

/// Which side of the play-field an entity was clamped against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Left,
    Right,
    Top,
    Bottom,
}

/// A positioned, sized, velocity-carrying game object (explorer, blob,
/// treasure, door). Plain mutable record : input only ever writes velocity,
/// the world tick is the only thing that writes position.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub position: Point,
    pub velocity: Point,
    pub width: f64,
    pub height: f64,
    pub alpha: f64,
}

pub type SharedEntity = Rc<RefCell<Entity>>;

impl Entity {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Entity {
            position: Point { x, y },
            velocity: Point { x: 0.0, y: 0.0 },
            width,
            height,
            alpha: 1.0,
        }
    }

    pub fn shared(self) -> SharedEntity {
        Rc::new(RefCell::new(self))
    }

    pub fn bounding_box(&self) -> Rect {
        Rect {
            x: self.position.x,
            y: self.position.y,
            width: self.width,
            height: self.height,
        }
    }

    pub fn overlaps(&self, other: &Entity) -> bool {
        self.bounding_box().intersects(&other.bounding_box())
    }

    /// Clamp this entity's box into `bounds`, reporting the clamped edge.
    ///
    /// The right/bottom checks compare against `bounds.width` and
    /// `bounds.height` directly : the play-field is anchored at the
    /// origin. When both axes clamp on the same
    /// call, the vertical edge (computed second) is the one reported :
    /// last-write-wins, deliberately not multi-edge reporting.
    pub fn contain(&mut self, bounds: &Rect) -> Option<Edge> {
        let mut hit = None;

        if self.position.x < bounds.x {
            self.position.x = bounds.x;
            hit = Some(Edge::Left);
        } else if self.position.x + self.width > bounds.width {
            self.position.x = bounds.width - self.width;
            hit = Some(Edge::Right);
        }

        if self.position.y < bounds.y {
            self.position.y = bounds.y;
            hit = Some(Edge::Top);
        } else if self.position.y + self.height > bounds.height {
            self.position.y = bounds.height - self.height;
            hit = Some(Edge::Bottom);
        }

        hit
    }
}

pub struct Renderer {
    context: CanvasRenderingContext2d,
}

impl Renderer {
    pub fn clear(&self, rect: &Rect) {
        self.context
            .clear_rect(rect.x, rect.y, rect.width, rect.height);
    }

    pub fn draw_image(&self, image: &HtmlImageElement, frame: &Rect, destination: &Rect) {
        self.context
            .draw_image_with_html_image_element_and_sw_and_sh_and_dx_and_dy_and_dw_and_dh(
                image,
                frame.x,
                frame.y,
                frame.width,
                frame.height,
                destination.x,
                destination.y,
                destination.width,
                destination.height,
            )
            .expect("Drawing is throwing exceptions! Unrecoverable error");
    }

    /// Global alpha applies to every draw call until set again
    pub fn set_alpha(&self, alpha: f64) {
        self.context.set_global_alpha(alpha);
    }

    pub fn fill_rect(&self, rect: &Rect, color: &str) {
        self.context.set_fill_style_str(color);
        self.context
            .fill_rect(rect.x, rect.y, rect.width, rect.height);
    }

    pub fn draw_text(&self, text: &str, position: &Point, font: &str, color: &str) {
        self.context.set_font(font);
        self.context.set_fill_style_str(color);
        self.context
            .fill_text(text, position.x, position.y)
            .expect("Drawing text is throwing exceptions! Unrecoverable error");
    }
}

/// Asynchronously load an image from a given source path
/// # Arguments
/// * `source` - string slice to path/url
/// # Returns
/// * `Ok(HtmlImageElement)` - on load success
/// * `Err` - on load fail
pub async fn load_image(source: &str) -> Result<HtmlImageElement> {
    let image = browser::new_image()?;
    let (tx, rx) = channel::<Result<(), Error>>();
    let success_tx = Rc::new(RefCell::new(Some(tx)));
    let error_tx = success_tx.clone();

    let success_callback = browser::closure_once(move || {
        if let Some(tx) = success_tx.borrow_mut().take() {
            let _ = tx.send(Ok(()));
        }
    });

    let error_callback = browser::closure_once(move |err: JsValue| {
        if let Some(tx) = error_tx.borrow_mut().take() {
            let _ = tx.send(Err(anyhow!(
                "[engine::load_image] Error loading image: {:#?}",
                err
            )));
        }
    });

    image.set_onload(Some(success_callback.as_ref().unchecked_ref()));
    image.set_onerror(Some(error_callback.as_ref().unchecked_ref()));
    image.set_src(source);

    // keep callback alive until image is loaded or errors
    success_callback.forget();
    error_callback.forget();

    // ?? - double unwrap because Result<Result<(), Error>, oneshot::Canceled>
    // - first unwrap yields channel result : Result<(), Error>
    // - second unwrap yields image load result : () or propagating Error
    rx.await??;

    Ok(image)
}
