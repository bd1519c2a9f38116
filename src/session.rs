/// Session key holding the signed-in [`crate::model::UserId`].
pub const USER_ID: &str = "user_id";
