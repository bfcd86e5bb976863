use diesel::{allow_tables_to_appear_in_same_query, table};

table! {
    notification_jobs (id) {
        id -> Text,
        template_id -> Text,
        audience -> Jsonb,
        data -> Jsonb,
        required_channels -> Nullable<Jsonb>,
        topic -> Nullable<Text>,
        status -> Text,
        status_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    notification_templates (id) {
        id -> Text,
        title -> Jsonb,
        body -> Jsonb,
        channels -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    user_preferences (uid) {
        uid -> Text,
        language -> Text,
        timezone -> Text,
        quiet_start -> Nullable<Text>,
        quiet_end -> Nullable<Text>,
        contact -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    deliveries (id) {
        id -> Text,
        job_id -> Text,
        uid -> Nullable<Text>,
        channel -> Text,
        status -> Text,
        provider -> Nullable<Text>,
        provider_message_id -> Nullable<Text>,
        error_code -> Nullable<Text>,
        error_message -> Nullable<Text>,
        attempts -> Integer,
        meta -> Nullable<Jsonb>,
        events -> Jsonb,
        created_at -> Timestamptz,
        sent_at -> Nullable<Timestamptz>,
        delivered_at -> Nullable<Timestamptz>,
        read_at -> Nullable<Timestamptz>,
    }
}

table! {
    inbox_notifications (id) {
        id -> Text,
        uid -> Text,
        job_id -> Text,
        title -> Text,
        body -> Text,
        action_url -> Nullable<Text>,
        topic -> Nullable<Text>,
        read -> Bool,
        read_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

table! {
    channel_outbox (id) {
        id -> BigInt,
        job_id -> Text,
        uid -> Text,
        channel -> Text,
        payload -> Jsonb,
        attempts -> Integer,
        next_attempt_at -> Timestamptz,
        last_error -> Nullable<Text>,
        created_at -> Timestamptz,
        processed_at -> Nullable<Timestamptz>,
        dead -> Bool,
    }
}

table! {
    link_codes (code) {
        code -> Text,
        uid -> Text,
        created_at -> Timestamptz,
        expires_at -> Timestamptz,
        used -> Bool,
        used_at -> Nullable<Timestamptz>,
        used_by_external_id -> Nullable<Text>,
    }
}

table! {
    chat_identities (provider, external_id) {
        provider -> Text,
        external_id -> Text,
        uid -> Nullable<Text>,
        followed -> Bool,
        last_seen_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

table! {
    oauth_tokens (provider) {
        provider -> Text,
        access_token -> Nullable<Text>,
        refresh_token -> Nullable<Text>,
        expires_at -> Nullable<Timestamptz>,
        updated_at -> Timestamptz,
    }
}

allow_tables_to_appear_in_same_query!(
    notification_jobs,
    notification_templates,
    user_preferences,
    deliveries,
    inbox_notifications,
    channel_outbox,
    link_codes,
    chat_identities,
    oauth_tokens,
);
