use std::fmt;

use super::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compass {
    North,
    East,
    South,
    West,
}

impl Compass {
    pub fn name(&self) -> &'static str {
        match self {
            Compass::North => "North",
            Compass::East => "East",
            Compass::South => "South",
            Compass::West => "West",
        }
    }

    pub fn from_letter(c: char) -> Option<Compass> {
        match c.to_ascii_uppercase() {
            'N' => Some(Compass::North),
            'E' => Some(Compass::East),
            'S' => Some(Compass::South),
            'W' => Some(Compass::West),
            _ => None,
        }
    }

    pub fn left(&self) -> Compass {
        match self {
            Compass::North => Compass::West,
            Compass::West => Compass::South,
            Compass::South => Compass::East,
            Compass::East => Compass::North,
        }
    }

    pub fn right(&self) -> Compass {
        match self {
            Compass::North => Compass::East,
            Compass::East => Compass::South,
            Compass::South => Compass::West,
            Compass::West => Compass::North,
        }
    }

    pub fn opposite(&self) -> Compass {
        self.left().left()
    }

    /// Grid offset, with y growing southwards.
    pub fn delta(&self) -> (i32, i32) {
        match self {
            Compass::North => (0, -1),
            Compass::East => (1, 0),
            Compass::South => (0, 1),
            Compass::West => (-1, 0),
        }
    }
}

impl fmt::Display for Compass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capabilities the engine needs from a controllable car.
pub trait Agent {
    /// Returns false when the move crashed the agent.
    fn move_forward(&mut self) -> bool;
    fn move_backward(&mut self) -> bool;
    fn turn_left(&mut self);
    fn turn_right(&mut self);
    fn honk(&mut self);
    fn crash(&mut self);
    fn is_crashed(&self) -> bool;
    fn is_road_ahead(&self) -> bool;
    fn is_cow_ahead(&self) -> bool;
    fn is_safe_to_move(&self) -> bool;
    fn is_at_finish(&self) -> bool;
    fn current_direction(&self) -> Compass;
    /// Answer from the pathfinding collaborator, if it has one.
    fn direction_to_finish(&self) -> Option<Compass>;
}

/// Agents by name, in registration order.
#[derive(Default)]
pub struct AgentRegistry {
    agents: Vec<(String, Box<dyn Agent>)>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        AgentRegistry::default()
    }

    /// Register `agent` under `name`, replacing any agent already there.
    pub fn register(&mut self, name: &str, agent: Box<dyn Agent>) {
        match self.agents.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = agent,
            None => self.agents.push((name.to_string(), agent)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, name: &str) -> Option<&dyn Agent> {
        self.agents.iter().find(|(n, _)| n == name).map(|(_, a)| a.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Agent>> {
        self.agents.iter_mut().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    pub fn names(&self) -> Vec<&str> {
        self.agents.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// The halting condition: at least one agent, and every one crashed.
    pub fn all_crashed(&self) -> bool {
        !self.agents.is_empty() && self.agents.iter().all(|(_, a)| a.is_crashed())
    }

    /// Receiver for bare calls outside any method.
    pub fn default_name(&self) -> Option<&str> {
        ["mainCar", "default"]
            .into_iter()
            .find(|name| self.contains(name))
            .or_else(|| self.agents.first().map(|(n, _)| n.as_str()))
    }
}

impl fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    MoveForward,
    MoveBackward,
    TurnLeft,
    TurnRight,
    Honk,
    IsRoadAhead,
    IsCowAhead,
    IsAtFinish,
    IsSafeToMove,
    GetCurrentDirection,
    GetDirectionToFinish,
}

impl Builtin {
    pub const ALL: [Builtin; 11] = [
        Builtin::MoveForward,
        Builtin::MoveBackward,
        Builtin::TurnLeft,
        Builtin::TurnRight,
        Builtin::Honk,
        Builtin::IsRoadAhead,
        Builtin::IsCowAhead,
        Builtin::IsAtFinish,
        Builtin::IsSafeToMove,
        Builtin::GetCurrentDirection,
        Builtin::GetDirectionToFinish,
    ];

    pub fn from_name(name: &str) -> Option<Builtin> {
        Builtin::ALL.into_iter().find(|b| b.name() == name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Builtin::MoveForward => "moveForward",
            Builtin::MoveBackward => "moveBackward",
            Builtin::TurnLeft => "turnLeft",
            Builtin::TurnRight => "turnRight",
            Builtin::Honk => "honk",
            Builtin::IsRoadAhead => "isRoadAhead",
            Builtin::IsCowAhead => "isCowAhead",
            Builtin::IsAtFinish => "isAtFinish",
            Builtin::IsSafeToMove => "isSafeToMove",
            Builtin::GetCurrentDirection => "getCurrentDirection",
            Builtin::GetDirectionToFinish => "getDirectionToFinish",
        }
    }

    pub fn names() -> impl Iterator<Item = &'static str> {
        Builtin::ALL.into_iter().map(|b| b.name())
    }

    pub fn arity(&self) -> usize {
        0
    }

    /// Commands with a visible effect; the driver waits a tick after each.
    pub fn is_delayed(&self) -> bool {
        matches!(
            self,
            Builtin::MoveForward | Builtin::MoveBackward | Builtin::TurnLeft | Builtin::TurnRight | Builtin::Honk
        )
    }

    /// Run against `agent`. Commands aimed at a crashed agent do nothing.
    pub fn invoke(&self, agent: &mut dyn Agent) -> Value {
        if self.is_delayed() && agent.is_crashed() {
            return Value::Null;
        }

        match self {
            Builtin::MoveForward => {
                agent.move_forward();
                Value::Null
            }
            Builtin::MoveBackward => {
                agent.move_backward();
                Value::Null
            }
            Builtin::TurnLeft => {
                agent.turn_left();
                Value::Null
            }
            Builtin::TurnRight => {
                agent.turn_right();
                Value::Null
            }
            Builtin::Honk => {
                agent.honk();
                Value::Null
            }
            Builtin::IsRoadAhead => Value::Bool(agent.is_road_ahead()),
            Builtin::IsCowAhead => Value::Bool(agent.is_cow_ahead()),
            Builtin::IsAtFinish => Value::Bool(agent.is_at_finish()),
            Builtin::IsSafeToMove => Value::Bool(agent.is_safe_to_move()),
            Builtin::GetCurrentDirection => Value::Str(agent.current_direction().name().to_string()),
            Builtin::GetDirectionToFinish => agent
                .direction_to_finish()
                .map(|d| Value::Str(d.name().to_string()))
                .unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Probe {
        moves: usize,
        heading: Option<Compass>,
        crashed: bool,
    }

    impl Agent for Probe {
        fn move_forward(&mut self) -> bool {
            self.moves += 1;
            true
        }
        fn move_backward(&mut self) -> bool {
            self.moves += 1;
            true
        }
        fn turn_left(&mut self) {
            self.heading = Some(self.current_direction().left());
        }
        fn turn_right(&mut self) {
            self.heading = Some(self.current_direction().right());
        }
        fn honk(&mut self) {}
        fn crash(&mut self) {
            self.crashed = true;
        }
        fn is_crashed(&self) -> bool {
            self.crashed
        }
        fn is_road_ahead(&self) -> bool {
            true
        }
        fn is_cow_ahead(&self) -> bool {
            false
        }
        fn is_safe_to_move(&self) -> bool {
            !self.crashed
        }
        fn is_at_finish(&self) -> bool {
            false
        }
        fn current_direction(&self) -> Compass {
            self.heading.unwrap_or(Compass::North)
        }
        fn direction_to_finish(&self) -> Option<Compass> {
            None
        }
    }

    #[test]
    fn test_builtin_table() {
        assert_eq!(Builtin::from_name("turnLeft"), Some(Builtin::TurnLeft));
        assert_eq!(Builtin::from_name("fly"), None);
        assert!(Builtin::Honk.is_delayed());
        assert!(!Builtin::IsRoadAhead.is_delayed());
        assert_eq!(Builtin::names().count(), Builtin::ALL.len());
    }

    #[test]
    fn test_crashed_agent_ignores_commands() {
        let mut probe = Probe::default();
        Builtin::MoveForward.invoke(&mut probe);
        probe.crash();
        Builtin::MoveForward.invoke(&mut probe);
        Builtin::TurnLeft.invoke(&mut probe);
        assert_eq!(probe.moves, 1);
        assert_eq!(probe.current_direction(), Compass::North);
        assert_eq!(Builtin::IsSafeToMove.invoke(&mut probe), Value::Bool(false));
    }

    #[test]
    fn test_direction_queries() {
        let mut probe = Probe::default();
        Builtin::TurnRight.invoke(&mut probe);
        assert_eq!(Builtin::GetCurrentDirection.invoke(&mut probe), Value::Str("East".into()));
        assert_eq!(Builtin::GetDirectionToFinish.invoke(&mut probe), Value::Null);
    }

    #[test]
    fn test_registry_default_agent() {
        let mut registry = AgentRegistry::new();
        registry.register("carB", Box::new(Probe::default()));
        assert_eq!(registry.default_name(), Some("carB"));
        registry.register("mainCar", Box::new(Probe::default()));
        assert_eq!(registry.default_name(), Some("mainCar"));
        assert_eq!(registry.names(), vec!["carB", "mainCar"]);
        assert!(!registry.all_crashed());
        for name in ["carB", "mainCar"] {
            registry.get_mut(name).unwrap().crash();
        }
        assert!(registry.all_crashed());
        assert!(!AgentRegistry::new().all_crashed());
    }

    #[test]
    fn test_compass_turns() {
        assert_eq!(Compass::North.left(), Compass::West);
        assert_eq!(Compass::West.right(), Compass::North);
        assert_eq!(Compass::East.opposite(), Compass::West);
        assert_eq!(Compass::from_letter('s'), Some(Compass::South));
    }
}
