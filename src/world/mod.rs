//! A small grid world for driving scripts outside the game: road tiles with
//! per-side connections, cows that step aside when honked at, a finish cell,
//! and cars exposed to the engine through [`Car`].

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use thiserror::Error;

use crate::engine::dispatch::{Agent, AgentRegistry, Compass};

pub type Position = (i32, i32);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MapError {
    #[error("map line {line}: {message}")]
    Invalid { line: usize, message: String },

    #[error("map has no rows")]
    Empty,
}

fn invalid(line: usize, message: impl Into<String>) -> MapError {
    MapError::Invalid { line, message: message.into() }
}

/// Road connections as a N/E/S/W bit set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Connections(u8);

impl Connections {
    pub const NONE: Connections = Connections(0);

    fn bit(direction: Compass) -> u8 {
        match direction {
            Compass::North => 0b0001,
            Compass::East => 0b0010,
            Compass::South => 0b0100,
            Compass::West => 0b1000,
        }
    }

    /// Parse a `NESW` flag string such as `"1010"` (north and south open).
    pub fn from_flags(flags: &str) -> Option<Connections> {
        if flags.len() != 4 {
            return None;
        }
        let order = [Compass::North, Compass::East, Compass::South, Compass::West];
        let mut mask = 0;
        for (ch, direction) in flags.chars().zip(order) {
            match ch {
                '1' => mask |= Connections::bit(direction),
                '0' => {}
                _ => return None,
            }
        }
        Some(Connections(mask))
    }

    pub fn with(self, direction: Compass) -> Connections {
        Connections(self.0 | Connections::bit(direction))
    }

    pub fn has(&self, direction: Compass) -> bool {
        self.0 & Connections::bit(direction) != 0
    }

    pub fn is_road(&self) -> bool {
        self.0 != 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tile {
    pub connections: Connections,
    pub finish: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cow {
    pub position: Position,
    pub alternate: Position,
}

impl Cow {
    /// Step over to the other spot.
    fn get_honked(&mut self) {
        std::mem::swap(&mut self.position, &mut self.alternate);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CarState {
    pub name: String,
    pub position: Position,
    pub heading: Compass,
    pub crashed: bool,
}

/// Answers "which way from here towards there". Pathfinding itself lives
/// outside this crate.
pub trait Navigator {
    fn direction(&self, world: &GridWorld, from: Position, target: Position) -> Option<Compass>;
}

pub struct GridWorld {
    width: i32,
    height: i32,
    tiles: Vec<Tile>,
    cows: Vec<Cow>,
    cars: Vec<CarState>,
    finish: Option<Position>,
    navigator: Option<Box<dyn Navigator>>,
}

fn step_from(position: Position, direction: Compass) -> Position {
    let (dx, dy) = direction.delta();
    (position.0 + dx, position.1 + dy)
}

impl GridWorld {
    pub fn new(width: i32, height: i32) -> Self {
        let size = (width.max(0) * height.max(0)) as usize;
        GridWorld {
            width,
            height,
            tiles: vec![Tile::default(); size],
            cows: Vec::new(),
            cars: Vec::new(),
            finish: None,
            navigator: None,
        }
    }

    /// Build a world from the text map format:
    ///
    /// ```text
    /// ..F
    /// ###
    /// car mainCar 0 1 E
    /// cow 1 0 2 0
    /// road 1 1 0101
    /// ```
    ///
    /// Grid rows use `.` for grass, `#` for road and `F` for the finish (also
    /// road). Road tiles connect to every orthogonal road neighbour unless a
    /// `road x y NESW` line sets their connections explicitly. `car` and `cow`
    /// lines place entities; a cow's second coordinate pair is where it goes
    /// when honked at.
    pub fn from_map(text: &str) -> Result<GridWorld, MapError> {
        let mut rows: Vec<&str> = Vec::new();
        let mut directives: Vec<(usize, Vec<&str>)> = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            if line.chars().all(|c| matches!(c, '.' | '#' | 'F')) {
                rows.push(line);
            } else {
                directives.push((index + 1, line.split_whitespace().collect()));
            }
        }

        if rows.is_empty() {
            return Err(MapError::Empty);
        }

        let width = rows.iter().map(|r| r.len()).max().unwrap_or(0) as i32;
        let height = rows.len() as i32;
        let mut world = GridWorld::new(width, height);

        let is_road_char = |x: i32, y: i32| -> bool {
            if x < 0 || y < 0 {
                return false;
            }
            rows.get(y as usize)
                .and_then(|row| row.as_bytes().get(x as usize))
                .is_some_and(|c| matches!(c, b'#' | b'F'))
        };

        for (y, row) in rows.iter().enumerate() {
            for (x, ch) in row.chars().enumerate() {
                let (x, y) = (x as i32, y as i32);
                if !is_road_char(x, y) {
                    continue;
                }
                let mut connections = Connections::NONE;
                for direction in [Compass::North, Compass::East, Compass::South, Compass::West] {
                    let (nx, ny) = step_from((x, y), direction);
                    if is_road_char(nx, ny) {
                        connections = connections.with(direction);
                    }
                }
                // an isolated road cell is still road
                if !connections.is_road() {
                    connections = Connections::from_flags("1111").unwrap_or_default();
                }
                if let Some(tile) = world.tile_mut((x, y)) {
                    tile.connections = connections;
                    tile.finish = ch == 'F';
                }
                if ch == 'F' {
                    world.finish = Some((x, y));
                }
            }
        }

        for (line, words) in directives {
            world.apply_directive(line, &words)?;
        }

        Ok(world)
    }

    fn apply_directive(&mut self, line: usize, words: &[&str]) -> Result<(), MapError> {
        let coord = |word: &str| -> Result<i32, MapError> {
            word.parse::<i32>()
                .map_err(|_| invalid(line, format!("'{}' is not a coordinate", word)))
        };

        match words {
            ["car", name, x, y, heading] => {
                let heading = heading
                    .chars()
                    .next()
                    .and_then(Compass::from_letter)
                    .ok_or_else(|| invalid(line, format!("unknown heading '{}'", heading)))?;
                let position = (coord(x)?, coord(y)?);
                self.check_bounds(line, position)?;
                if self.car(name).is_some() {
                    return Err(invalid(line, format!("car '{}' is placed twice", name)));
                }
                self.add_car(name, position, heading);
            }
            ["cow", x, y, ax, ay] => {
                let position = (coord(x)?, coord(y)?);
                let alternate = (coord(ax)?, coord(ay)?);
                self.check_bounds(line, position)?;
                self.check_bounds(line, alternate)?;
                self.add_cow(position, alternate);
            }
            ["road", x, y, flags] => {
                let position = (coord(x)?, coord(y)?);
                self.check_bounds(line, position)?;
                let connections = Connections::from_flags(flags)
                    .ok_or_else(|| invalid(line, format!("bad connection flags '{}'", flags)))?;
                if let Some(tile) = self.tile_mut(position) {
                    tile.connections = connections;
                }
            }
            [kind @ ("car" | "cow" | "road"), ..] => {
                return Err(invalid(line, format!("wrong number of fields for '{}'", kind)))
            }
            [keyword, ..] => return Err(invalid(line, format!("unknown directive '{}'", keyword))),
            [] => {}
        }
        Ok(())
    }

    fn check_bounds(&self, line: usize, position: Position) -> Result<(), MapError> {
        if self.in_bounds(position) {
            Ok(())
        } else {
            Err(invalid(line, format!("({}, {}) is outside the map", position.0, position.1)))
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn in_bounds(&self, (x, y): Position) -> bool {
        x >= 0 && y >= 0 && x < self.width && y < self.height
    }

    fn index(&self, position: Position) -> Option<usize> {
        self.in_bounds(position)
            .then(|| (position.1 * self.width + position.0) as usize)
    }

    pub fn tile(&self, position: Position) -> Option<&Tile> {
        self.index(position).and_then(|i| self.tiles.get(i))
    }

    pub fn tile_mut(&mut self, position: Position) -> Option<&mut Tile> {
        self.index(position).and_then(move |i| self.tiles.get_mut(i))
    }

    pub fn set_road(&mut self, position: Position, connections: Connections) {
        if let Some(tile) = self.tile_mut(position) {
            tile.connections = connections;
        }
    }

    pub fn set_finish(&mut self, position: Position) {
        if let Some(tile) = self.tile_mut(position) {
            tile.finish = true;
            self.finish = Some(position);
        }
    }

    pub fn finish(&self) -> Option<Position> {
        self.finish
    }

    pub fn add_car(&mut self, name: &str, position: Position, heading: Compass) {
        self.cars.push(CarState {
            name: name.to_string(),
            position,
            heading,
            crashed: false,
        });
    }

    pub fn add_cow(&mut self, position: Position, alternate: Position) {
        self.cows.push(Cow { position, alternate });
    }

    pub fn set_navigator(&mut self, navigator: Box<dyn Navigator>) {
        self.navigator = Some(navigator);
    }

    pub fn cars(&self) -> &[CarState] {
        &self.cars
    }

    pub fn car(&self, name: &str) -> Option<&CarState> {
        self.cars.iter().find(|c| c.name == name)
    }

    pub fn cows(&self) -> &[Cow] {
        &self.cows
    }

    pub fn cow_at(&self, position: Position) -> bool {
        self.cows.iter().any(|c| c.position == position)
    }

    /// Both tiles must be road and open towards each other.
    pub fn is_connected(&self, from: Position, direction: Compass) -> bool {
        let to = step_from(from, direction);
        match (self.tile(from), self.tile(to)) {
            (Some(a), Some(b)) => a.connections.has(direction) && b.connections.has(direction.opposite()),
            _ => false,
        }
    }

    /// Try to drive car `index` one cell. A missing connection or a cow in
    /// the way crashes the car.
    fn drive(&mut self, index: usize, direction: Compass) -> bool {
        let Some(car) = self.cars.get(index) else {
            return false;
        };
        if car.crashed {
            return false;
        }

        let from = car.position;
        let to = step_from(from, direction);
        let blocked = !self.is_connected(from, direction) || self.cow_at(to);

        let Some(car) = self.cars.get_mut(index) else {
            return false;
        };
        if blocked {
            car.crashed = true;
            false
        } else {
            car.position = to;
            true
        }
    }

    /// Every cow orthogonally next to `position` steps to its other spot.
    fn honk_from(&mut self, position: Position) {
        let neighbours: Vec<Position> = [Compass::North, Compass::East, Compass::South, Compass::West]
            .into_iter()
            .map(|d| step_from(position, d))
            .collect();
        for cow in self.cows.iter_mut().filter(|c| neighbours.contains(&c.position)) {
            cow.get_honked();
        }
    }

    /// Shared handle plus one [`Car`] agent per placed car, registered under
    /// the car's name in placement order.
    pub fn into_agents(self) -> (Rc<RefCell<GridWorld>>, AgentRegistry) {
        let names: Vec<String> = self.cars.iter().map(|c| c.name.clone()).collect();
        let world = Rc::new(RefCell::new(self));
        let mut registry = AgentRegistry::new();
        for (index, name) in names.iter().enumerate() {
            registry.register(name, Box::new(Car::new(Rc::clone(&world), index)));
        }
        (world, registry)
    }
}

impl fmt::Display for GridWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for y in 0..self.height {
            let mut row = String::with_capacity(self.width as usize);
            for x in 0..self.width {
                let position = (x, y);
                let car = self.cars.iter().find(|c| c.position == position);
                let ch = match car {
                    Some(car) if car.crashed => 'X',
                    Some(car) => match car.heading {
                        Compass::North => '^',
                        Compass::East => '>',
                        Compass::South => 'v',
                        Compass::West => '<',
                    },
                    None if self.cow_at(position) => 'C',
                    None => match self.tile(position) {
                        Some(tile) if tile.finish => 'F',
                        Some(tile) if tile.connections.is_road() => '#',
                        _ => '.',
                    },
                };
                row.push(ch);
            }
            writeln!(f, "{}", row)?;
        }
        Ok(())
    }
}

/// One car of a shared [`GridWorld`].
pub struct Car {
    world: Rc<RefCell<GridWorld>>,
    index: usize,
}

impl Car {
    pub fn new(world: Rc<RefCell<GridWorld>>, index: usize) -> Self {
        Car { world, index }
    }

    fn state(&self) -> Option<CarState> {
        self.world.borrow().cars.get(self.index).cloned()
    }

    fn ahead(&self) -> Option<Position> {
        self.state().map(|c| step_from(c.position, c.heading))
    }

    fn turn(&mut self, rotate: fn(&Compass) -> Compass) {
        if let Some(car) = self.world.borrow_mut().cars.get_mut(self.index) {
            car.heading = rotate(&car.heading);
        }
    }
}

impl Agent for Car {
    fn move_forward(&mut self) -> bool {
        let Some(heading) = self.state().map(|c| c.heading) else {
            return false;
        };
        self.world.borrow_mut().drive(self.index, heading)
    }

    fn move_backward(&mut self) -> bool {
        let Some(heading) = self.state().map(|c| c.heading) else {
            return false;
        };
        self.world.borrow_mut().drive(self.index, heading.opposite())
    }

    fn turn_left(&mut self) {
        self.turn(Compass::left);
    }

    fn turn_right(&mut self) {
        self.turn(Compass::right);
    }

    fn honk(&mut self) {
        if let Some(car) = self.state() {
            self.world.borrow_mut().honk_from(car.position);
        }
    }

    fn crash(&mut self) {
        if let Some(car) = self.world.borrow_mut().cars.get_mut(self.index) {
            car.crashed = true;
        }
    }

    fn is_crashed(&self) -> bool {
        self.state().map_or(true, |c| c.crashed)
    }

    fn is_road_ahead(&self) -> bool {
        self.state()
            .is_some_and(|c| self.world.borrow().is_connected(c.position, c.heading))
    }

    fn is_cow_ahead(&self) -> bool {
        self.ahead().is_some_and(|p| self.world.borrow().cow_at(p))
    }

    fn is_safe_to_move(&self) -> bool {
        self.is_road_ahead() && !self.is_cow_ahead()
    }

    fn is_at_finish(&self) -> bool {
        let world = self.world.borrow();
        match (world.cars.get(self.index), world.finish) {
            (Some(car), Some(finish)) => car.position == finish,
            _ => false,
        }
    }

    fn current_direction(&self) -> Compass {
        self.state().map_or(Compass::North, |c| c.heading)
    }

    fn direction_to_finish(&self) -> Option<Compass> {
        let world = self.world.borrow();
        let car = world.cars.get(self.index)?;
        let finish = world.finish?;
        world.navigator.as_ref()?.direction(&world, car.position, finish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer;
    use crate::engine::{Engine, EngineConfig, StepStatus};

    const TRACK: &str = "\
.....F
######
car mainCar 0 1 E
";

    fn world(map: &str) -> (Rc<RefCell<GridWorld>>, AgentRegistry) {
        GridWorld::from_map(map).unwrap().into_agents()
    }

    #[test]
    fn test_from_map_connects_roads() {
        let world = GridWorld::from_map(TRACK).unwrap();
        assert_eq!((world.width(), world.height()), (6, 2));
        assert_eq!(world.finish(), Some((5, 0)));
        assert!(world.is_connected((0, 1), Compass::East));
        assert!(world.is_connected((5, 1), Compass::North));
        assert!(!world.is_connected((0, 1), Compass::North));
        assert!(!world.is_connected((0, 1), Compass::West));
    }

    #[test]
    fn test_driving_and_crashing() {
        let (world, mut registry) = world(TRACK);
        let car = registry.get_mut("mainCar").unwrap();
        assert!(car.is_road_ahead());
        assert!(car.move_forward());
        car.turn_left();
        assert_eq!(car.current_direction(), Compass::North);
        assert!(!car.is_road_ahead());
        assert!(!car.move_forward());
        assert!(car.is_crashed());
        assert_eq!(world.borrow().car("mainCar").map(|c| c.position), Some((1, 1)));
    }

    #[test]
    fn test_explicit_connections_block_movement() {
        let map = "###\ncar a 0 0 E\nroad 1 0 0100";
        let (_, mut registry) = world(map);
        let car = registry.get_mut("a").unwrap();
        assert!(!car.is_road_ahead());
        assert!(!car.move_forward());
        assert!(car.is_crashed());
    }

    #[test]
    fn test_cow_blocks_until_honked() {
        let map = "###\n.#.\ncar a 0 0 E\ncow 1 0 1 1";
        let (world, mut registry) = world(map);
        let car = registry.get_mut("a").unwrap();
        assert!(car.is_cow_ahead());
        assert!(!car.is_safe_to_move());
        car.honk();
        assert_eq!(world.borrow().cows()[0].position, (1, 1));
        assert!(car.is_safe_to_move());
        assert!(car.move_forward());
    }

    #[test]
    fn test_moving_into_cow_crashes() {
        let map = "###\ncar a 0 0 E\ncow 1 0 2 0";
        let (_, mut registry) = world(map);
        let car = registry.get_mut("a").unwrap();
        assert!(!car.move_forward());
        assert!(car.is_crashed());
    }

    #[test]
    fn test_finish_and_navigator() {
        struct Straight;
        impl Navigator for Straight {
            fn direction(&self, _: &GridWorld, from: Position, target: Position) -> Option<Compass> {
                if target.0 > from.0 {
                    Some(Compass::East)
                } else if target.1 < from.1 {
                    Some(Compass::North)
                } else {
                    None
                }
            }
        }

        let (world, mut registry) = world("###F\ncar a 0 0 E");
        let car = registry.get_mut("a").unwrap();
        assert_eq!(car.direction_to_finish(), None);
        world.borrow_mut().set_navigator(Box::new(Straight));
        assert_eq!(car.direction_to_finish(), Some(Compass::East));
        for _ in 0..3 {
            assert!(car.move_forward());
        }
        assert!(car.is_at_finish());
    }

    #[test]
    fn test_map_errors() {
        assert!(matches!(GridWorld::from_map("car a 0 0 N"), Err(MapError::Empty)));
        let err = GridWorld::from_map("##\ncar a 5 0 N").err().unwrap();
        assert_eq!(err.to_string(), "map line 2: (5, 0) is outside the map");
        let err = GridWorld::from_map("##\nboat 1 1").err().unwrap();
        assert_eq!(err.to_string(), "map line 2: unknown directive 'boat'");
        assert!(GridWorld::from_map("##\ncar a 0 0 Q").is_err());
        let err = GridWorld::from_map("##\ncow 1 1").err().unwrap();
        assert_eq!(err.to_string(), "map line 2: wrong number of fields for 'cow'");
    }

    #[test]
    fn test_render() {
        let (world, mut registry) = world("###\n...\ncar a 0 0 E\ncow 2 0 2 1");
        assert_eq!(world.borrow().to_string(), ">#C\n...\n");
        registry.get_mut("a").unwrap().turn_right();
        assert_eq!(world.borrow().to_string(), "v#C\n...\n");
    }

    fn run(source: &str, map: &str) -> (Rc<RefCell<GridWorld>>, Vec<StepStatus>) {
        let (world, registry) = world(map);
        let names: Vec<String> = world.borrow().cars().iter().map(|c| c.name.clone()).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let checked = analyzer::check(source, &names);
        assert!(checked.valid, "{:?}", checked.errors);

        let mut engine = Engine::load(&checked.program, registry, EngineConfig::default());
        let mut statuses = Vec::new();
        for _ in 0..1000 {
            let step = engine.step();
            statuses.push(step.status);
            if step.is_finished() {
                break;
            }
        }
        (world, statuses)
    }

    #[test]
    fn test_script_reaches_finish() {
        let (world, statuses) = run("while (isAtFinish() == false) {\n    moveForward();\n}", "####F\ncar mainCar 0 0 E");
        assert_eq!(statuses.iter().filter(|s| **s == StepStatus::Paused).count(), 4);
        assert_eq!(statuses.last(), Some(&StepStatus::Complete));
        let world = world.borrow();
        let car = world.car("mainCar").unwrap();
        assert_eq!(car.position, (4, 0));
        assert!(!car.crashed);
    }

    #[test]
    fn test_crash_is_contained_to_one_car() {
        let map = "\
###F
....
##..
car carA 0 0 E
car carB 0 2 E
";
        let source = "\
carA.moveForward();
carB.moveForward();
carA.moveForward();
carB.moveForward();
carA.moveForward();
carB.moveForward();
";
        let (world, statuses) = run(source, map);
        assert_eq!(statuses.last(), Some(&StepStatus::Complete));
        let world = world.borrow();
        let a = world.car("carA").unwrap();
        let b = world.car("carB").unwrap();
        assert_eq!((a.position, a.crashed), ((3, 0), false));
        assert_eq!((b.position, b.crashed), ((1, 2), true));
    }

    #[test]
    fn test_all_crashed_completes_early() {
        let (world, statuses) = run("while (true) {\n    turnLeft();\n    moveForward();\n}", "##\ncar mainCar 0 0 E");
        assert_eq!(statuses.last(), Some(&StepStatus::Complete));
        assert!(world.borrow().car("mainCar").unwrap().crashed);
    }
}
