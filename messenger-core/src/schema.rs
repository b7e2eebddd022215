use diesel::{allow_tables_to_appear_in_same_query, table};

table! {
    chats (id) {
        id -> BigInt,
        chat_type -> Text,
        match_id -> Nullable<BigInt>,
        assigned_ticket_id -> Nullable<BigInt>,
        is_closed -> Bool,
        version -> Integer,
        created_at -> Timestamptz,
        updated_at -> Nullable<Timestamptz>,
    }
}

table! {
    chat_memberships (id) {
        id -> BigInt,
        chat_id -> BigInt,
        user_id -> BigInt,
        user_role -> Text,
        is_primary_member -> Bool,
        has_write_permission -> Bool,
        is_archive_member -> Bool,
        first_available_message_id -> Nullable<BigInt>,
        last_available_message_id -> Nullable<BigInt>,
        last_read_message_id -> BigInt,
        created_at -> Timestamptz,
    }
}

table! {
    messages (id) {
        id -> BigInt,
        chat_id -> BigInt,
        sender_id -> Nullable<BigInt>,
        content -> Jsonb,
        created_at -> Timestamptz,
    }
}

table! {
    matches (id) {
        id -> BigInt,
        team_a_name -> Text,
        team_b_name -> Text,
        state -> Text,
        created_at -> Timestamptz,
        updated_at -> Nullable<Timestamptz>,
    }
}

table! {
    match_scouts (id) {
        id -> BigInt,
        match_id -> BigInt,
        user_id -> BigInt,
        scout_number -> Nullable<BigInt>,
        is_main_scout -> Bool,
    }
}

table! {
    tickets (id) {
        id -> BigInt,
        status -> Text,
        created_by_user_id -> BigInt,
        chat_id -> BigInt,
        match_id -> Nullable<BigInt>,
        created_at -> Timestamptz,
        updated_at -> Nullable<Timestamptz>,
    }
}

table! {
    users (id) {
        id -> BigInt,
        name -> Text,
        role -> Text,
        scout_number -> Nullable<BigInt>,
        created_at -> Timestamptz,
    }
}

table! {
    push_configs (device_id) {
        device_id -> Text,
        user_id -> BigInt,
        endpoint -> Text,
        p256dh -> Text,
        auth -> Text,
        last_alive_at -> Timestamptz,
        created_at -> Timestamptz,
    }
}

allow_tables_to_appear_in_same_query!(
    chats,
    chat_memberships,
    messages,
    matches,
    match_scouts,
    tickets,
    users,
    push_configs,
);
