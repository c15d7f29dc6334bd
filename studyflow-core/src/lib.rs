//! studyflow-core: study priority scoring, session lifecycle and adaptive
//! scheduling for the studyflow planner

pub mod adaptation;
pub mod cadence;
pub mod config;
pub mod error;
pub mod jobs;
pub mod lifecycle;
pub mod memory;
pub mod orchestrator;
pub mod patterns;
pub mod planner;
pub mod priority;
pub mod reminders;
pub mod rescheduling;
pub mod schedule;
pub mod session;
pub mod store;
pub mod subject;
pub mod time;

pub use adaptation::{
    AdaptationOutcome, AdaptationResult, AdaptationTrigger, AllocationDelta, PerformanceSample,
    SkipReason,
};
pub use cadence::Cadence;
pub use config::{
    AdaptationSection, LifecycleSection, PlannerConfig, PrioritySection, PriorityWeights,
    SchedulingSection,
};
pub use error::{ConfigError, DispatchError, LifecycleError, PlannerError, StoreError};
pub use jobs::{BatchReport, JobKind, JobRun, JobSpec};
pub use lifecycle::{CompletionReport, TransitionOutcome};
pub use memory::{InMemoryJobLock, InMemoryStore, StoreSnapshot};
pub use orchestrator::Orchestrator;
pub use patterns::{BehaviorPatterns, DayPeriod, detect_patterns};
pub use planner::{GeneratedWeek, generate_week};
pub use priority::{PriorityBreakdown, SubjectContext, score};
pub use reminders::{ReminderPayload, ReminderPolicy};
pub use schedule::{Schedule, ScheduleId};
pub use session::{SessionAction, SessionId, SessionStatus, SessionType, StudySession};
pub use store::{JobLock, NotificationDispatcher, PlannerStore};
pub use subject::{Difficulty, SubjectForUser, SubjectId, User, UserId};
pub use time::{Clock, FixedClock, SystemClock};
