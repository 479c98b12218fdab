use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::ParseIdError;

/// Named room capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
	AssignRoles,
	ManageRoles,
	Ban,
	Kick,
	MuteUserChat,
	Broadcast,
	PlayMedia,
	RoomDetails,
}

impl Capability {
	pub const ALL: [Capability; 8] = [
		Capability::AssignRoles,
		Capability::ManageRoles,
		Capability::Ban,
		Capability::Kick,
		Capability::MuteUserChat,
		Capability::Broadcast,
		Capability::PlayMedia,
		Capability::RoomDetails,
	];

	/// Stable string identifier, as stored in role permission maps.
	pub const fn as_str(self) -> &'static str {
		match self {
			Capability::AssignRoles => "assignRoles",
			Capability::ManageRoles => "manageRoles",
			Capability::Ban => "ban",
			Capability::Kick => "kick",
			Capability::MuteUserChat => "muteUserChat",
			Capability::Broadcast => "broadcast",
			Capability::PlayMedia => "playMedia",
			Capability::RoomDetails => "roomDetails",
		}
	}
}

impl fmt::Display for Capability {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Capability {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Capability::ALL
			.into_iter()
			.find(|c| c.as_str() == s)
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("unknown capability {s:?}")))
	}
}

/// Permission map of a role: capability name -> granted.
///
/// Names absent from the map are not granted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(BTreeMap<String, bool>);

impl Permissions {
	pub fn none() -> Self {
		Self::default()
	}

	/// Every known capability set to `true`.
	pub fn all() -> Self {
		Self(Capability::ALL.iter().map(|c| (c.as_str().to_string(), true)).collect())
	}

	pub fn from_granted(caps: impl IntoIterator<Item = Capability>) -> Self {
		let mut out = Self::default();
		for cap in caps {
			out.set(cap, true);
		}
		out
	}

	pub fn set(&mut self, cap: Capability, granted: bool) {
		self.0.insert(cap.as_str().to_string(), granted);
	}

	/// Set an arbitrary named capability.
	pub fn set_named(&mut self, name: impl Into<String>, granted: bool) {
		self.0.insert(name.into(), granted);
	}

	pub fn grants(&self, name: &str) -> bool {
		self.0.get(name).copied().unwrap_or(false)
	}

	pub fn allows(&self, cap: Capability) -> bool {
		self.grants(cap.as_str())
	}

	/// Capabilities set to `true`, in name order.
	pub fn granted(&self) -> impl Iterator<Item = &str> {
		self.0.iter().filter(|(_, v)| **v).map(|(k, _)| k.as_str())
	}

	/// OR `other` into `self`.
	pub fn merge(&mut self, other: &Permissions) {
		for (name, granted) in &other.0 {
			if *granted {
				self.0.insert(name.clone(), true);
			} else {
				self.0.entry(name.clone()).or_insert(false);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn capability_parse_and_display() {
		assert_eq!("muteUserChat".parse::<Capability>().unwrap(), Capability::MuteUserChat);
		assert_eq!(Capability::RoomDetails.to_string(), "roomDetails");
		assert!("fly".parse::<Capability>().is_err());
	}

	#[test]
	fn unknown_names_are_not_granted() {
		let perms = Permissions::from_granted([Capability::Kick]);
		assert!(perms.allows(Capability::Kick));
		assert!(!perms.allows(Capability::Ban));
		assert!(!perms.grants("somethingElse"));
	}

	#[test]
	fn merge_is_an_or() {
		let mut a = Permissions::from_granted([Capability::Kick]);
		let mut b = Permissions::none();
		b.set(Capability::Kick, false);
		b.set(Capability::Ban, true);

		a.merge(&b);
		assert!(a.allows(Capability::Kick));
		assert!(a.allows(Capability::Ban));
		assert_eq!(a.granted().collect::<Vec<_>>(), vec!["ban", "kick"]);
	}
}
