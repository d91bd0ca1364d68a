use crate::browser;
use crate::engine;
use crate::engine::input::Keyboard;
use crate::engine::{Edge, Entity, Game, Point, Rect, Renderer, SharedEntity};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::join;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::rc::Rc;
use web_sys::HtmlImageElement;

// TABLE
// ┌──────────────────────── Data Flow Per Tick ─────────────────────────────┐
// │                                                                         │
// │  Keyboard ──press/release──► player.velocity                            │
// │                                   │                                     │
// │                                   ▼                                     │
// │  World::update : integrate ─► contain ─► blob bounce ─► overlap tests   │
// │                                   │                                     │
// │                                   ▼                                     │
// │  health / phase side effects ─► entity fields are the render truth      │
// │                                                                         │
// └─────────────────────────────────────────────────────────────────────────┘
pub enum TreasureHunter {
    /// Initial state while the atlas and image are being fetched
    Loading,

    /// Active game with the dungeon scene fully built
    Loaded(Dungeon),
}

// movement tuning, in pixels per tick
const PLAYER_SPEED: f64 = 5.0;
const BLOB_SPEED: f64 = 2.0;
const BLOB_COUNT: usize = 6;
const BLOB_SPACING: f64 = 48.0;
const BLOB_X_OFFSET: f64 = 150.0;

// scene layout
const EXPLORER_X: f64 = 68.0;
const TREASURE_MARGIN: f64 = 48.0;
const DOOR_POSITION: Point = Point { x: 32.0, y: 0.0 };

// the treasure rides slightly inset once picked up
const CARRY_OFFSET: f64 = 8.0;

const STARTING_HEALTH: i32 = 128;
const HIT_ALPHA: f64 = 0.5;

// health bar, top-right corner
const HEALTH_BAR_WIDTH: f64 = 128.0;
const HEALTH_BAR_HEIGHT: f64 = 8.0;
const HEALTH_BAR_INSET: f64 = 170.0;

mod atlas {
    pub const SHEET_PATH: &str = "images/treasureHunter.json";
    pub const IMAGE_PATH: &str = "images/treasureHunter.png";

    pub const DUNGEON: &str = "dungeon.png";
    pub const EXPLORER: &str = "explorer.png";
    pub const TREASURE: &str = "treasure.png";
    pub const DOOR: &str = "door.png";
    pub const BLOB: &str = "blob.png";
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Sheet {
    frames: HashMap<String, Cell>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
struct Cell {
    frame: SheetRect,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
struct SheetRect {
    x: f64,
    y: f64,
    w: f64,
    h: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Win,
    Lose,
}

/// `Ended` is terminal for the session : the render loop keeps ticking but
/// the world stops mutating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GamePhase {
    Playing,
    Ended(Outcome),
}

/// The per-tick game-state machine. Owns the phase and the health counter;
/// holds shared references to the entities, which the scene-setup side
/// created (and which the renderer reads directly after each tick).
pub struct World {
    player: SharedEntity,
    treasure: SharedEntity,
    door: SharedEntity,
    blobs: Vec<SharedEntity>,
    bounds: Rect,
    phase: GamePhase,
    health: i32,
}

impl World {
    pub fn new(
        player: SharedEntity,
        treasure: SharedEntity,
        door: SharedEntity,
        blobs: Vec<SharedEntity>,
        bounds: Rect,
    ) -> Self {
        World {
            player,
            treasure,
            door,
            blobs,
            bounds,
            phase: GamePhase::Playing,
            health: STARTING_HEALTH,
        }
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn health(&self) -> i32 {
        self.health
    }

    pub fn player(&self) -> &SharedEntity {
        &self.player
    }

    /// One tick. `delta` is accepted from the loop but does not scale
    /// movement : speed is per-tick.
    pub fn update(&mut self, _delta: f32) {
        if let GamePhase::Ended(_) = self.phase {
            return;
        }

        {
            let mut player = self.player.borrow_mut();
            player.position.x += player.velocity.x;
            player.position.y += player.velocity.y;
            // edge report unused for the player, clamping is enough
            let _ = player.contain(&self.bounds);
        }

        let mut player_hit = false;
        for blob in &self.blobs {
            let mut blob = blob.borrow_mut();
            blob.position.y += blob.velocity.y;
            // blobs only patrol vertically : bounce on top/bottom, ignore
            // the horizontal edges
            match blob.contain(&self.bounds) {
                Some(Edge::Top) | Some(Edge::Bottom) => blob.velocity.y = -blob.velocity.y,
                _ => {}
            }
            if self.player.borrow().overlaps(&blob) {
                player_hit = true;
            }
        }

        {
            let mut player = self.player.borrow_mut();
            if player_hit {
                player.alpha = HIT_ALPHA;
                // one unit per tick, no matter how many blobs overlapped
                self.health -= 1;
            } else {
                player.alpha = 1.0;
            }

            let mut treasure = self.treasure.borrow_mut();
            if player.overlaps(&treasure) {
                treasure.position.x = player.position.x + CARRY_OFFSET;
                treasure.position.y = player.position.y + CARRY_OFFSET;
            }

            if treasure.overlaps(&self.door.borrow()) {
                self.phase = GamePhase::Ended(Outcome::Win);
            } else if self.health < 0 {
                // strictly below zero : a tick that lands exactly on zero
                // is still in play
                self.phase = GamePhase::Ended(Outcome::Lose);
            }
        }
    }
}

/// The loaded scene : world state plus the render/input resources
pub struct Dungeon {
    world: World,
    sheet: Sheet,
    image: HtmlImageElement,
    // kept alive for the session; dropping it would unhook the listeners
    _keyboard: Keyboard,
}

impl TreasureHunter {
    pub fn new() -> Self {
        TreasureHunter::Loading
    }

    async fn load_sheet() -> Result<Sheet> {
        browser::fetch_json::<Sheet>(atlas::SHEET_PATH)
            .await
            .with_context(|| format!("Failed to load texture atlas from : {}", atlas::SHEET_PATH))
    }

    async fn load_image() -> Result<HtmlImageElement> {
        engine::load_image(atlas::IMAGE_PATH)
            .await
            .with_context(|| format!("Failed to load atlas image from : {}", atlas::IMAGE_PATH))
    }
}

impl Default for TreasureHunter {
    fn default() -> Self {
        Self::new()
    }
}

fn frame_size(sheet: &Sheet, name: &str) -> Result<(f64, f64)> {
    sheet
        .frames
        .get(name)
        .map(|cell| (cell.frame.w, cell.frame.h))
        .ok_or_else(|| anyhow!("Atlas has no frame named '{}'", name))
}

fn random_row(max: f64) -> f64 {
    rand::thread_rng().gen_range(0.0..=max.max(0.0))
}

/// Build the dungeon scene : explorer on the left, treasure by the right
/// wall, door at the top, six blobs patrolling up and down in between.
fn build_world(sheet: &Sheet, bounds: Rect) -> Result<World> {
    // the background is blitted every frame; fail at setup, not mid-draw
    frame_size(sheet, atlas::DUNGEON)?;

    let (explorer_w, explorer_h) = frame_size(sheet, atlas::EXPLORER)?;
    let player = Entity::new(
        EXPLORER_X,
        bounds.height / 2.0 - explorer_h / 2.0,
        explorer_w,
        explorer_h,
    )
    .shared();

    let (treasure_w, treasure_h) = frame_size(sheet, atlas::TREASURE)?;
    let treasure = Entity::new(
        bounds.width - treasure_w - TREASURE_MARGIN,
        bounds.height / 2.0 - treasure_h / 2.0,
        treasure_w,
        treasure_h,
    )
    .shared();

    let (door_w, door_h) = frame_size(sheet, atlas::DOOR)?;
    let door = Entity::new(DOOR_POSITION.x, DOOR_POSITION.y, door_w, door_h).shared();

    let (blob_w, blob_h) = frame_size(sheet, atlas::BLOB)?;
    let mut blobs = Vec::with_capacity(BLOB_COUNT);
    let mut direction = 1.0;
    for i in 0..BLOB_COUNT {
        let mut blob = Entity::new(
            BLOB_SPACING * i as f64 + BLOB_X_OFFSET,
            random_row(bounds.height - blob_h),
            blob_w,
            blob_h,
        );
        blob.velocity.y = BLOB_SPEED * direction;
        direction = -direction;
        blobs.push(blob.shared());
    }

    Ok(World::new(player, treasure, door, blobs, bounds))
}

/// Wire the arrow keys to the player's velocity. Press steers; release
/// stops only if the opposite key is up and the other axis is idle, so a
/// held key wins over a released one.
fn wire_arrow_keys(keyboard: &Keyboard, player: &SharedEntity) {
    let left = keyboard.register("ArrowLeft");
    let up = keyboard.register("ArrowUp");
    let right = keyboard.register("ArrowRight");
    let down = keyboard.register("ArrowDown");

    {
        let player = Rc::clone(player);
        left.on_press(move || {
            let mut player = player.borrow_mut();
            player.velocity.x = -PLAYER_SPEED;
            player.velocity.y = 0.0;
        });
    }
    {
        let player = Rc::clone(player);
        let right = right.clone();
        left.on_release(move || {
            let mut player = player.borrow_mut();
            if !right.is_down() && player.velocity.y == 0.0 {
                player.velocity.x = 0.0;
            }
        });
    }

    {
        let player = Rc::clone(player);
        up.on_press(move || {
            let mut player = player.borrow_mut();
            player.velocity.y = -PLAYER_SPEED;
            player.velocity.x = 0.0;
        });
    }
    {
        let player = Rc::clone(player);
        let down = down.clone();
        up.on_release(move || {
            let mut player = player.borrow_mut();
            if !down.is_down() && player.velocity.x == 0.0 {
                player.velocity.y = 0.0;
            }
        });
    }

    {
        let player = Rc::clone(player);
        right.on_press(move || {
            let mut player = player.borrow_mut();
            player.velocity.x = PLAYER_SPEED;
            player.velocity.y = 0.0;
        });
    }
    {
        let player = Rc::clone(player);
        let left = left.clone();
        right.on_release(move || {
            let mut player = player.borrow_mut();
            if !left.is_down() && player.velocity.y == 0.0 {
                player.velocity.x = 0.0;
            }
        });
    }

    {
        let player = Rc::clone(player);
        down.on_press(move || {
            let mut player = player.borrow_mut();
            player.velocity.y = PLAYER_SPEED;
            player.velocity.x = 0.0;
        });
    }
    {
        let player = Rc::clone(player);
        let up = up.clone();
        down.on_release(move || {
            let mut player = player.borrow_mut();
            if !up.is_down() && player.velocity.x == 0.0 {
                player.velocity.y = 0.0;
            }
        });
    }
}

#[async_trait(?Send)]
impl Game for TreasureHunter {
    async fn initialize(&self) -> Result<Box<dyn Game>> {
        match self {
            TreasureHunter::Loading => {
                // atlas and image are independent : fetch them in parallel
                let (sheet_result, image_result) =
                    join!(TreasureHunter::load_sheet(), TreasureHunter::load_image());
                let sheet = sheet_result?;
                let image = image_result?;

                let canvas = browser::canvas()?;
                let bounds = Rect::new(0.0, 0.0, canvas.width() as f64, canvas.height() as f64);

                let world = build_world(&sheet, bounds)?;

                let keyboard = Keyboard::attach()?;
                wire_arrow_keys(&keyboard, world.player());

                log!(
                    "dungeon ready : {}x{}, {} blobs",
                    bounds.width,
                    bounds.height,
                    BLOB_COUNT
                );

                Ok(Box::new(TreasureHunter::Loaded(Dungeon {
                    world,
                    sheet,
                    image,
                    _keyboard: keyboard,
                })))
            }
            TreasureHunter::Loaded(_) => Err(anyhow!("Game is already initialized")),
        }
    }

    fn update(&mut self, delta: f32) {
        if let TreasureHunter::Loaded(dungeon) = self {
            let before = dungeon.world.phase();
            dungeon.world.update(delta);
            let after = dungeon.world.phase();
            if before != after {
                log!("game over : {:?}", after);
            }
        }
    }

    fn draw(&self, renderer: &Renderer) {
        if let TreasureHunter::Loaded(dungeon) = self {
            dungeon.draw(renderer);
        }
    }
}

impl Dungeon {
    fn draw(&self, renderer: &Renderer) {
        let bounds = self.world.bounds;
        renderer.clear(&bounds);

        // Draw order matters : background -> actors -> overlay
        self.draw_frame_at(renderer, atlas::DUNGEON, &Point { x: 0.0, y: 0.0 });
        self.draw_entity(renderer, atlas::DOOR, &self.world.door.borrow());
        for blob in &self.world.blobs {
            self.draw_entity(renderer, atlas::BLOB, &blob.borrow());
        }
        self.draw_entity(renderer, atlas::TREASURE, &self.world.treasure.borrow());
        self.draw_entity(renderer, atlas::EXPLORER, &self.world.player.borrow());

        self.draw_health_bar(renderer, &bounds);

        match self.world.phase() {
            GamePhase::Ended(Outcome::Win) => self.draw_message(renderer, &bounds, "You won!"),
            GamePhase::Ended(Outcome::Lose) => self.draw_message(renderer, &bounds, "You lost!"),
            GamePhase::Playing => {}
        }
    }

    fn frame(&self, name: &str) -> Rect {
        let cell = self.sheet.frames.get(name).expect("Cell not found");
        Rect::new(cell.frame.x, cell.frame.y, cell.frame.w, cell.frame.h)
    }

    fn draw_frame_at(&self, renderer: &Renderer, name: &str, position: &Point) {
        let frame = self.frame(name);
        renderer.draw_image(
            &self.image,
            &frame,
            &Rect::new(position.x, position.y, frame.width, frame.height),
        );
    }

    fn draw_entity(&self, renderer: &Renderer, name: &str, entity: &Entity) {
        renderer.set_alpha(entity.alpha);
        renderer.draw_image(&self.image, &self.frame(name), &entity.bounding_box());
        renderer.set_alpha(1.0);
    }

    fn draw_health_bar(&self, renderer: &Renderer, bounds: &Rect) {
        let x = bounds.width - HEALTH_BAR_INSET;
        renderer.fill_rect(
            &Rect::new(x, 4.0, HEALTH_BAR_WIDTH, HEALTH_BAR_HEIGHT),
            "black",
        );
        let remaining = self.world.health().clamp(0, STARTING_HEALTH) as f64;
        renderer.fill_rect(&Rect::new(x, 4.0, remaining, HEALTH_BAR_HEIGHT), "red");
    }

    fn draw_message(&self, renderer: &Renderer, bounds: &Rect, text: &str) {
        renderer.draw_text(
            text,
            &Point {
                x: bounds.width / 4.0,
                y: bounds.height / 2.0,
            },
            "64px Futura",
            "white",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: f32 = crate::engine::FRAME_SIZE;

    fn bounds() -> Rect {
        Rect::new(0.0, 0.0, 512.0, 512.0)
    }

    /// A world with the player mid-field, the treasure and door far apart,
    /// and no blobs. Tests add what they need.
    fn quiet_world() -> World {
        World::new(
            Entity::new(100.0, 100.0, 32.0, 32.0).shared(),
            Entity::new(400.0, 400.0, 16.0, 16.0).shared(),
            Entity::new(32.0, 0.0, 32.0, 32.0).shared(),
            Vec::new(),
            bounds(),
        )
    }

    fn blob_at(x: f64, y: f64, vy: f64) -> SharedEntity {
        let mut blob = Entity::new(x, y, 24.0, 24.0);
        blob.velocity.y = vy;
        blob.shared()
    }

    fn sheet_with(names: &[&str]) -> Sheet {
        let mut frames = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            frames.insert(
                name.to_string(),
                Cell {
                    frame: SheetRect {
                        x: i as f64 * 32.0,
                        y: 0.0,
                        w: 32.0,
                        h: 32.0,
                    },
                },
            );
        }
        Sheet { frames }
    }

    #[test]
    fn scene_setup_requires_every_atlas_frame() {
        let complete = sheet_with(&[
            atlas::DUNGEON,
            atlas::EXPLORER,
            atlas::TREASURE,
            atlas::DOOR,
            atlas::BLOB,
        ]);
        assert!(build_world(&complete, bounds()).is_ok());

        // a missing background must fail setup, not the first draw
        let missing_background =
            sheet_with(&[atlas::EXPLORER, atlas::TREASURE, atlas::DOOR, atlas::BLOB]);
        assert!(build_world(&missing_background, bounds()).is_err());
    }

    #[test]
    fn player_integrates_velocity_and_stays_in_bounds() {
        let mut world = quiet_world();
        {
            let mut player = world.player.borrow_mut();
            player.position = Point { x: 2.0, y: 100.0 };
            player.velocity = Point { x: -PLAYER_SPEED, y: 0.0 };
        }

        world.update(TICK);

        let player = world.player.borrow();
        assert_eq!(player.position.x, 0.0);
        assert_eq!(player.position.y, 100.0);
    }

    #[test]
    fn overlapping_blob_decrements_health_and_dims_player() {
        let mut world = quiet_world();
        world.blobs.push(blob_at(100.0, 100.0, 0.0));

        world.update(TICK);

        assert_eq!(world.health(), STARTING_HEALTH - 1);
        assert_eq!(world.player.borrow().alpha, HIT_ALPHA);
        assert_eq!(world.phase(), GamePhase::Playing);
    }

    #[test]
    fn alpha_restores_once_clear_of_blobs() {
        let mut world = quiet_world();
        world.blobs.push(blob_at(100.0, 100.0, 0.0));
        world.update(TICK);
        assert_eq!(world.player.borrow().alpha, HIT_ALPHA);

        world.blobs.clear();
        world.update(TICK);
        assert_eq!(world.player.borrow().alpha, 1.0);
    }

    #[test]
    fn simultaneous_overlaps_cost_one_health_unit() {
        let mut world = quiet_world();
        world.blobs.push(blob_at(100.0, 100.0, 0.0));
        world.blobs.push(blob_at(110.0, 100.0, 0.0));
        world.blobs.push(blob_at(100.0, 110.0, 0.0));

        world.update(TICK);

        assert_eq!(world.health(), STARTING_HEALTH - 1);
    }

    #[test]
    fn health_zero_is_still_playing() {
        let mut world = quiet_world();
        world.blobs.push(blob_at(100.0, 100.0, 0.0));
        world.health = 1;

        world.update(TICK);

        assert_eq!(world.health(), 0);
        assert_eq!(world.phase(), GamePhase::Playing);
    }

    #[test]
    fn health_below_zero_loses_on_the_same_tick() {
        let mut world = quiet_world();
        world.blobs.push(blob_at(100.0, 100.0, 0.0));
        world.health = 0;

        world.update(TICK);

        assert_eq!(world.health(), -1);
        assert_eq!(world.phase(), GamePhase::Ended(Outcome::Lose));
    }

    #[test]
    fn blob_bounces_off_the_top_edge() {
        let mut world = quiet_world();
        world.blobs.push(blob_at(300.0, 0.0, -BLOB_SPEED));

        world.update(TICK);

        let blob = world.blobs[0].borrow();
        assert_eq!(blob.position.y, 0.0);
        assert_eq!(blob.velocity.y, BLOB_SPEED);
    }

    #[test]
    fn blob_bounces_off_the_bottom_edge() {
        let mut world = quiet_world();
        world.blobs.push(blob_at(300.0, 488.0, BLOB_SPEED));

        world.update(TICK);

        let blob = world.blobs[0].borrow();
        assert_eq!(blob.position.y, 488.0);
        assert_eq!(blob.velocity.y, -BLOB_SPEED);
    }

    #[test]
    fn treasure_follows_the_player_once_picked_up() {
        let mut world = quiet_world();
        {
            let mut treasure = world.treasure.borrow_mut();
            treasure.position = Point { x: 110.0, y: 110.0 };
        }

        world.update(TICK);

        let player = world.player.borrow();
        let treasure = world.treasure.borrow();
        assert_eq!(treasure.position.x, player.position.x + CARRY_OFFSET);
        assert_eq!(treasure.position.y, player.position.y + CARRY_OFFSET);
    }

    #[test]
    fn treasure_reaching_the_door_wins() {
        let mut world = quiet_world();
        {
            let mut treasure = world.treasure.borrow_mut();
            treasure.position = Point { x: 40.0, y: 8.0 };
        }

        world.update(TICK);

        assert_eq!(world.phase(), GamePhase::Ended(Outcome::Win));
    }

    #[test]
    fn ended_is_terminal_and_the_tick_becomes_a_no_op() {
        let mut world = quiet_world();
        {
            let mut treasure = world.treasure.borrow_mut();
            treasure.position = Point { x: 40.0, y: 8.0 };
        }
        world.update(TICK);
        assert_eq!(world.phase(), GamePhase::Ended(Outcome::Win));

        // a later tick must not move anything, even with velocity set
        {
            let mut player = world.player.borrow_mut();
            player.velocity = Point { x: PLAYER_SPEED, y: 0.0 };
        }
        world.blobs.push(blob_at(100.0, 100.0, 0.0));
        let position_before = world.player.borrow().position;
        let health_before = world.health();

        world.update(TICK);

        assert_eq!(world.player.borrow().position, position_before);
        assert_eq!(world.health(), health_before);
        assert_eq!(world.phase(), GamePhase::Ended(Outcome::Win));
    }

    #[test]
    fn delta_does_not_scale_movement() {
        // frame-rate-dependent on purpose : a huge delta moves the player
        // exactly one step, same as a tiny one
        let mut world = quiet_world();
        world.player.borrow_mut().velocity = Point { x: PLAYER_SPEED, y: 0.0 };

        world.update(1000.0 * TICK);

        assert_eq!(world.player.borrow().position.x, 100.0 + PLAYER_SPEED);
    }
}
