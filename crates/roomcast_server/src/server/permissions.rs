#![forbid(unsafe_code)]

use std::collections::HashSet;

use chrono::Utc;
use roomcast_domain::{
	Capability, Enrollment, EnrollmentFilter, EnrollmentSubject, Identity, Permissions, Role, RoleTag, Room, RoomName,
};
use tracing::info;
use uuid::Uuid;

use crate::server::errors::{EngineError, EngineResult, OrInternal};
use crate::server::rooms::RoomDirectory;

const MAX_ROLE_NAME_LEN: usize = 64;

/// Resolves capabilities from room ownership, default roles and enrollments, and manages roles.
#[derive(Clone)]
pub struct PermissionResolver {
	rooms: RoomDirectory,
}

impl PermissionResolver {
	pub fn new(rooms: RoomDirectory) -> Self {
		Self { rooms }
	}

	/// Roles that apply to `identity` in `room`: every default role plus enrolled ones, in role order.
	async fn applicable_roles(&self, room: &Room, identity: &Identity) -> EngineResult<Vec<Role>> {
		let docs = self.rooms.docs();
		let roles = docs.roles(&room.name).await.or_internal("load roles")?;

		// Anonymous identities missing ip or session only get the defaults.
		let enrolled: HashSet<Uuid> = match EnrollmentFilter::for_identity(room.name.clone(), identity) {
			Ok(filter) => docs
				.enrollments(&filter)
				.await
				.or_internal("load enrollments")?
				.into_iter()
				.map(|e| e.role_id)
				.collect(),
			Err(_) => HashSet::new(),
		};

		Ok(roles
			.into_iter()
			.filter(|r| r.is_default || enrolled.contains(&r.id))
			.collect())
	}

	/// Whether `identity` holds `capability` in `room`. The owner holds everything.
	///
	/// Returns `NotFound` if the room does not exist.
	pub async fn has_permission(&self, room: &RoomName, identity: &Identity, capability: Capability) -> EngineResult<bool> {
		let room = self.rooms.load(room).await?;
		if room.is_owner(identity.user_id.as_ref()) {
			return Ok(true);
		}
		let roles = self.applicable_roles(&room, identity).await?;
		Ok(roles.iter().any(|r| r.permissions.allows(capability)))
	}

	/// Like [`has_permission`](Self::has_permission) but fails with `EngineError::Permission`.
	pub async fn require(&self, room: &RoomName, identity: &Identity, capability: Capability) -> EngineResult<()> {
		if self.has_permission(room, identity, capability).await? {
			Ok(())
		} else {
			Err(EngineError::permission(capability))
		}
	}

	/// Union of every applicable role's permission map.
	pub async fn effective_permissions(&self, room: &RoomName, identity: &Identity) -> EngineResult<Permissions> {
		let room = self.rooms.load(room).await?;
		if room.is_owner(identity.user_id.as_ref()) {
			return Ok(Permissions::all());
		}
		let mut out = Permissions::none();
		for role in self.applicable_roles(&room, identity).await? {
			out.merge(&role.permissions);
		}
		Ok(out)
	}

	/// Tags of the roles `identity` is explicitly enrolled in.
	pub async fn role_tags(&self, room: &RoomName, identity: &Identity) -> EngineResult<Vec<String>> {
		let room = self.rooms.load(room).await?;
		Ok(self
			.applicable_roles(&room, identity)
			.await?
			.into_iter()
			.filter(|r| !r.is_default)
			.map(|r| r.tag.as_str().to_string())
			.collect())
	}

	pub async fn list_roles(&self, room: &RoomName) -> EngineResult<Vec<Role>> {
		self.rooms.load(room).await?;
		self.rooms.docs().roles(room).await.or_internal("load roles")
	}

	async fn role_by_tag(&self, room: &RoomName, tag: &str) -> EngineResult<Role> {
		self.list_roles(room)
			.await?
			.into_iter()
			.find(|r| r.tag.as_str() == tag)
			.ok_or_else(|| EngineError::not_found(format!("role {tag}")))
	}

	/// Create a role; the tag is derived from the name and suffixed `-2`, `-3`… on collision.
	pub async fn create_role(
		&self,
		room: &RoomName,
		actor: &Identity,
		name: &str,
		permissions: Permissions,
	) -> EngineResult<Role> {
		let name = name.trim();
		if name.is_empty() || name.chars().count() > MAX_ROLE_NAME_LEN {
			return Err(EngineError::validation(format!(
				"role name must be 1-{MAX_ROLE_NAME_LEN} characters"
			)));
		}

		let _guard = self.rooms.lock(room).await;
		self.require(room, actor, Capability::ManageRoles).await?;

		let existing = self.list_roles(room).await?;
		let base = RoleTag::from_name(name)?;
		let mut tag = base.clone();
		let mut n = 2;
		while existing.iter().any(|r| r.tag == tag) {
			tag = base.with_suffix(n)?;
			n += 1;
		}
		let order = existing.iter().map(|r| r.order).max().unwrap_or(0) + 1;

		let role = Role::new(room.clone(), name, tag, order, permissions);
		self.rooms.docs().put_role(&role).await.or_internal("save role")?;
		info!(room = %room, tag = %role.tag, actor = %actor, "role created");
		Ok(role)
	}

	/// Rename a role and/or replace its permission map.
	pub async fn update_role(
		&self,
		room: &RoomName,
		actor: &Identity,
		tag: &str,
		name: Option<&str>,
		permissions: Option<Permissions>,
	) -> EngineResult<Role> {
		let _guard = self.rooms.lock(room).await;
		self.require(room, actor, Capability::ManageRoles).await?;

		let mut role = self.role_by_tag(room, tag).await?;
		if let Some(name) = name.map(str::trim) {
			if name.is_empty() || name.chars().count() > MAX_ROLE_NAME_LEN {
				return Err(EngineError::validation(format!(
					"role name must be 1-{MAX_ROLE_NAME_LEN} characters"
				)));
			}
			role.name = name.to_string();
		}
		if let Some(permissions) = permissions {
			role.permissions = permissions;
		}
		self.rooms.docs().put_role(&role).await.or_internal("save role")?;
		Ok(role)
	}

	/// Delete a custom role and its enrollments.
	pub async fn delete_role(&self, room: &RoomName, actor: &Identity, tag: &str) -> EngineResult<()> {
		let _guard = self.rooms.lock(room).await;
		self.require(room, actor, Capability::ManageRoles).await?;

		let role = self.role_by_tag(room, tag).await?;
		if role.built_in {
			return Err(EngineError::validation(format!("role {tag} is built in and cannot be deleted")));
		}
		self.rooms
			.docs()
			.delete_role(room, role.id)
			.await
			.or_internal("delete role")?;
		info!(room = %room, tag, actor = %actor, "role deleted");
		Ok(())
	}

	/// Enroll `target` in the role tagged `tag`. Enrolling twice returns the existing enrollment.
	pub async fn enroll(&self, room: &RoomName, actor: &Identity, tag: &str, target: &Identity) -> EngineResult<Enrollment> {
		let _guard = self.rooms.lock(room).await;
		self.require(room, actor, Capability::AssignRoles).await?;

		let role = self.role_by_tag(room, tag).await?;
		if role.is_default {
			return Err(EngineError::validation(format!("role {tag} already applies to everyone")));
		}

		let filter = EnrollmentFilter::for_identity(room.clone(), target)?;
		let docs = self.rooms.docs();
		if let Some(existing) = docs
			.enrollments(&filter)
			.await
			.or_internal("load enrollments")?
			.into_iter()
			.find(|e| e.role_id == role.id)
		{
			return Ok(existing);
		}

		let enrollment = Enrollment {
			id: Uuid::new_v4(),
			room: room.clone(),
			role_id: role.id,
			subject: EnrollmentSubject::for_identity(target),
			enrolled_by: Some(actor.to_string()),
			enrolled_at: Utc::now(),
		};
		docs.put_enrollment(&enrollment).await.or_internal("save enrollment")?;
		info!(room = %room, tag, target = %target, actor = %actor, "role assigned");
		Ok(enrollment)
	}

	/// Remove `target` from the role. Returns `false` if they were not enrolled.
	pub async fn unenroll(&self, room: &RoomName, actor: &Identity, tag: &str, target: &Identity) -> EngineResult<bool> {
		let _guard = self.rooms.lock(room).await;
		self.require(room, actor, Capability::AssignRoles).await?;

		let role = self.role_by_tag(room, tag).await?;
		let filter = EnrollmentFilter::for_identity(room.clone(), target)?;
		let docs = self.rooms.docs();
		let mut removed = false;
		for e in docs
			.enrollments(&filter)
			.await
			.or_internal("load enrollments")?
			.into_iter()
			.filter(|e| e.role_id == role.id)
		{
			removed |= docs.delete_enrollment(e.id).await.or_internal("delete enrollment")?;
		}
		if removed {
			info!(room = %room, tag, target = %target, actor = %actor, "role unassigned");
		}
		Ok(removed)
	}
}
