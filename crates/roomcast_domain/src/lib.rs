#![forbid(unsafe_code)]

pub mod capability;
pub mod ids;
pub mod moderation;
pub mod role;
pub mod room;

pub use capability::{Capability, Permissions};
pub use ids::{ConnectionId, Identity, ParseIdError, RoomName, UserId};
pub use moderation::{
	BanLookup, ChatLine, IdentitySnapshot, ModerationActivity, Report, ReportOutcome, Resolution, Restrictions, RoomClosure,
	SiteBan, Staff,
};
pub use role::{Enrollment, EnrollmentFilter, EnrollmentSubject, Role, RoleTag};
pub use room::{BanEntry, Participant, PlaylistItem, RelayAttachment, Room, RoomSettings, Topic};
