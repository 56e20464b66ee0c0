/// Lua script for compare-and-set writes of a key's limit state
///
/// The stored record is a JSON object carrying a `revision` field. The write
/// only happens if the stored revision still equals the revision the caller
/// loaded, so two instances can never both apply a check to the same
/// pre-increment state.
///
/// KEYS[1] = the state key
/// ARGV[1] = expected revision (the one that was loaded)
/// ARGV[2] = serialized state (already carrying revision + 1)
/// ARGV[3] = expiry in seconds
///
/// Returns: [stored (0/1), current revision]
pub const SAVE_STATE_SCRIPT: &str = r#"
local key = KEYS[1]
local expected = tonumber(ARGV[1])
local payload = ARGV[2]
local ttl = tonumber(ARGV[3])

-- Read the revision currently stored
local current = redis.call('GET', key)
local revision = 0
if current then
    local ok, decoded = pcall(cjson.decode, current)
    if ok and type(decoded) == 'table' and decoded['revision'] then
        revision = tonumber(decoded['revision']) or 0
    end
end

if revision ~= expected then
    return {0, revision}
end

-- Store with a fresh expiry
redis.call('SET', key, payload, 'EX', ttl)

return {1, expected + 1}
"#;
