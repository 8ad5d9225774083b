//! Chat operations decoupled from the transport: each function validates,
//! persists, and returns the payload to push plus the set of identities the
//! realtime layer must fan it out to.

use shared::{
    domain::{CallId, GroupId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{AttachmentPayload, MessagePayload},
};
use storage::{NewMessage, Storage, StoredAttachment, StoredMessage};

/// Content a call-invite message is rewritten to once its room empties.
pub const CALL_ENDED_CONTENT: &str = "Call ended";

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

/// Destination set of a message, resolved at routing time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Self-chat: no destination beyond the author.
    SelfChat,
    Direct(UserId),
    Group(Vec<UserId>),
}

impl Delivery {
    /// Every identity that receives events for this message, author included,
    /// each exactly once.
    pub fn recipients(&self, author: &UserId) -> Vec<UserId> {
        let mut out = vec![author.clone()];
        match self {
            Delivery::SelfChat => {}
            Delivery::Direct(user_id) => {
                if user_id != author {
                    out.push(user_id.clone());
                }
            }
            Delivery::Group(members) => {
                for member in members {
                    if member != author {
                        out.push(member.clone());
                    }
                }
            }
        }
        out
    }
}

pub async fn send_message(
    ctx: &ApiContext,
    sender: &UserId,
    to_user_id: Option<UserId>,
    to_group_id: Option<GroupId>,
    content: String,
    attachment: Option<AttachmentPayload>,
    call_id: Option<CallId>,
) -> Result<(MessagePayload, Delivery), ApiError> {
    if to_user_id.is_some() && to_group_id.is_some() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message must target a user, a group, or neither (self-chat)",
        ));
    }
    if content.is_empty() && attachment.is_none() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message needs content or an attachment",
        ));
    }

    let delivery = match (&to_user_id, &to_group_id) {
        (Some(user_id), None) => {
            ctx.storage
                .find_user(user_id)
                .await
                .map_err(internal)?
                .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "recipient not found"))?;
            Delivery::Direct(user_id.clone())
        }
        (None, Some(group_id)) => {
            let group = ctx
                .storage
                .find_group(group_id)
                .await
                .map_err(internal)?
                .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "group not found"))?;
            if !group.members.contains(sender) {
                return Err(ApiError::new(
                    ErrorCode::Forbidden,
                    "sender is not a group member",
                ));
            }
            Delivery::Group(group.members)
        }
        _ => Delivery::SelfChat,
    };

    let stored = ctx
        .storage
        .insert_message(NewMessage {
            from_user_id: sender.clone(),
            to_user_id,
            to_group_id,
            content,
            attachment: attachment.map(stored_attachment),
            call_id,
        })
        .await
        .map_err(internal)?;

    Ok((payload_from_stored(stored), delivery))
}

pub async fn edit_message(
    ctx: &ApiContext,
    caller: &UserId,
    message_id: &MessageId,
    content: String,
) -> Result<(MessagePayload, Delivery), ApiError> {
    let updated = ctx
        .storage
        .update_message_content(message_id, caller, &content)
        .await
        .map_err(internal)?;
    let Some(updated) = updated else {
        return Err(not_author_error(ctx, message_id).await);
    };
    let delivery = delivery_for(ctx, &updated).await?;
    Ok((payload_from_stored(updated), delivery))
}

pub async fn delete_message(
    ctx: &ApiContext,
    caller: &UserId,
    message_id: &MessageId,
) -> Result<(MessageId, Delivery), ApiError> {
    let removed = ctx
        .storage
        .delete_message(message_id, caller)
        .await
        .map_err(internal)?;
    let Some(removed) = removed else {
        return Err(not_author_error(ctx, message_id).await);
    };
    let delivery = delivery_for(ctx, &removed).await?;
    Ok((removed.id, delivery))
}

pub async fn load_history(ctx: &ApiContext, user_id: &UserId) -> Result<Vec<MessagePayload>, ApiError> {
    let messages = ctx
        .storage
        .messages_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(payload_from_stored).collect())
}

/// Rewrites the call's most recent invite message to its terminal state.
/// Returns None when no message referenced the call (nothing to re-deliver).
pub async fn end_call(
    ctx: &ApiContext,
    call_id: &CallId,
) -> Result<Option<(MessagePayload, Delivery)>, ApiError> {
    let updated = ctx
        .storage
        .mark_call_ended(call_id, CALL_ENDED_CONTENT)
        .await
        .map_err(internal)?;
    let Some(updated) = updated else {
        return Ok(None);
    };
    let delivery = delivery_for(ctx, &updated).await?;
    Ok(Some((payload_from_stored(updated), delivery)))
}

pub async fn resolve_username(ctx: &ApiContext, username: &str) -> Result<Option<UserId>, ApiError> {
    let user = ctx
        .storage
        .find_user_by_username(username)
        .await
        .map_err(internal)?;
    Ok(user.map(|u| u.id))
}

/// Recomputes a stored message's destination set. Group membership is read at
/// call time, so edits reach the group's current members.
async fn delivery_for(ctx: &ApiContext, message: &StoredMessage) -> Result<Delivery, ApiError> {
    if let Some(group_id) = &message.to_group_id {
        let members = ctx
            .storage
            .group_members(group_id)
            .await
            .map_err(internal)?;
        return Ok(Delivery::Group(members));
    }
    if let Some(user_id) = &message.to_user_id {
        return Ok(Delivery::Direct(user_id.clone()));
    }
    Ok(Delivery::SelfChat)
}

/// The conditional update matched nothing: distinguish a missing message from
/// a foreign one so the caller gets a precise error.
async fn not_author_error(ctx: &ApiContext, message_id: &MessageId) -> ApiError {
    match ctx.storage.find_message(message_id).await {
        Ok(Some(_)) => ApiError::new(ErrorCode::Forbidden, "only the author may modify a message"),
        Ok(None) => ApiError::new(ErrorCode::NotFound, "message not found"),
        Err(error) => internal(error),
    }
}

pub fn payload_from_stored(message: StoredMessage) -> MessagePayload {
    MessagePayload {
        id: message.id,
        from_user_id: message.from_user_id,
        to_user_id: message.to_user_id,
        to_group_id: message.to_group_id,
        content: message.content,
        attachment: message.attachment.map(|a| AttachmentPayload {
            kind: a.kind,
            storage_key: a.storage_key,
            display_name: a.display_name,
            url: a.url,
        }),
        call_id: message.call_id,
        timestamp: message.created_at,
        edited: message.edited,
        call_ended: message.call_ended,
    }
}

fn stored_attachment(attachment: AttachmentPayload) -> StoredAttachment {
    StoredAttachment {
        kind: attachment.kind,
        storage_key: attachment.storage_key,
        display_name: attachment.display_name,
        url: attachment.url,
    }
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
